//! The contract with the underlying network transport.
//!
//! The engine never performs TCP/TLS/HTTP framing itself - it drives an
//! implementation of [`Transport`] and consumes the stream of
//! [`TransportEvent`]s a connection produces. Control flows the other way
//! through the per-connection [`TransportHandle`].
//!
//! When interception needs header visibility, a connection is opened with
//! [`ConnectRequest::expose_header_client`] set, and the transport delivers
//! [`HeaderClientEvent`]s for the request through the factory (routed by
//! [`TransportId`]). Each such event carries a one-shot reply channel; a
//! dropped reply means "proceed unchanged".

use std::future::Future;

use bytes::Bytes;
use http::{header::HeaderName, HeaderMap, Method, StatusCode, Uri};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Identifier the transport assigns to an in-flight exchange. Allocated
/// independently from [`RequestId`](crate::request::RequestId)s.
pub type TransportId = u64;

/// Relative scheduling priority of an exchange, forwarded opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Connection failures reported by the transport. Surfaced verbatim to the
/// caller; retry policy, if any, belongs to the transport itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("transport stream closed unexpectedly")]
    StreamClosed,
}

/// Everything the transport needs to open an exchange.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: Uri,
    pub method: Method,
    pub headers: HeaderMap,
    /// Ask the transport for synchronous header interception on this
    /// exchange.
    pub expose_header_client: bool,
}

/// Events produced by one transport exchange, in stream order.
#[derive(Debug)]
pub enum TransportEvent {
    /// The server answered with a redirect. The exchange is paused until
    /// [`TransportHandle::follow_redirect`] is called.
    Redirect {
        target: Uri,
        status: StatusCode,
        headers: HeaderMap,
    },
    /// Final response headers.
    Headers {
        status: StatusCode,
        headers: HeaderMap,
    },
    /// A chunk of response body.
    BodyData(Bytes),
    /// End of the exchange.
    Completed(Result<(), TransportError>),
}

/// Per-connection control handle. All operations are fire-and-forget from
/// the engine's perspective.
pub trait TransportHandle: Send {
    /// Resumes a paused redirect. `new_url` overrides the declared target -
    /// the escape hatch for listener-authored redirects.
    fn follow_redirect(
        &self,
        removed_headers: Vec<HeaderName>,
        modified_headers: HeaderMap,
        new_url: Option<Uri>,
    );

    fn set_priority(&self, priority: RequestPriority);

    /// Tears the exchange down. Safe to call more than once.
    fn abort(&self);
}

/// A live exchange: the transport's id for it, its event stream, and its
/// control handle.
pub struct TransportConnection {
    pub transport_id: TransportId,
    pub events: mpsc::Receiver<TransportEvent>,
    pub handle: Box<dyn TransportHandle>,
}

/// The underlying network I/O layer.
pub trait Transport: Send + Sync + 'static {
    fn connect(
        &self,
        request: ConnectRequest,
    ) -> impl Future<Output = Result<TransportConnection, TransportError>> + Send;
}

/// Synchronous header interception callbacks, delivered only for exchanges
/// opened with [`ConnectRequest::expose_header_client`].
#[derive(Debug)]
pub enum HeaderClientEvent {
    /// Request headers are about to hit the wire.
    BeforeSendHeaders {
        headers: HeaderMap,
        reply: oneshot::Sender<HeaderClientVerdict>,
    },
    /// Response headers arrived and may still be rewritten.
    HeadersReceived {
        status: StatusCode,
        status_line: Option<String>,
        headers: HeaderMap,
        reply: oneshot::Sender<HeaderClientVerdict>,
    },
}

/// Header rewrites the engine hands back to the transport.
#[derive(Debug, Default)]
pub struct HeaderOverrides {
    pub headers: Option<HeaderMap>,
    pub status_line: Option<String>,
}

/// The engine's answer to a [`HeaderClientEvent`].
#[derive(Debug)]
pub enum HeaderClientVerdict {
    Proceed(HeaderOverrides),
    Cancel,
}
