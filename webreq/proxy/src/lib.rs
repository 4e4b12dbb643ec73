//! HTTP request interception and listener dispatch.
//!
//! This crate multiplexes outgoing HTTP(S) requests across an ordered set of
//! host-registered listener stages (`beforeRequest`, `beforeSendHeaders`,
//! `sendHeaders`, `headersReceived`, `beforeRedirect`, `responseStarted`,
//! `errorOccurred`, `completed`). Blocking stages may rewrite the URL,
//! request headers, or response headers, or cancel the request outright;
//! only then is the (possibly modified) request forwarded to the real
//! network transport.
//!
//! The moving parts:
//!
//! * [`registry::ListenerRegistry`] - one listener per stage, scoped by URL
//!   patterns,
//! * [`dispatcher::EventDispatcher`] - runs single listener invocations and
//!   folds replies back into the request,
//! * [`factory::ProxyingFactory`] - accepts request creation calls and owns
//!   one state-machine task per in-flight request,
//! * [`transport::Transport`] - the seam to the actual network I/O layer,
//!   which this crate never implements itself.

use std::time::Duration;

pub mod background_tasks;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod factory;
pub mod invocation;
pub mod registry;
pub mod request;
pub mod transport;

pub use webreq_match_pattern::{MatchPattern, MatchPatternSet};

/// Engine-wide policy knobs, validated once at factory construction.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// How long a blocking stage waits for a listener reply before
    /// proceeding without it. [`None`] waits indefinitely - an unresponsive
    /// listener then stalls its request for the lifetime of the connection.
    pub listener_timeout: Option<Duration>,
    /// Size of the channels used to communicate with per-request tasks.
    pub channel_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listener_timeout: None,
            channel_size: 512,
        }
    }
}

impl ProxyConfig {
    /// Clamps nonsensical values instead of erroring.
    pub(crate) fn validated(mut self) -> Self {
        self.channel_size = self.channel_size.max(1);
        self
    }
}
