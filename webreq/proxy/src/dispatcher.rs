//! Runs single listener invocations and folds their replies back into the
//! request state.
//!
//! Blocking dispatches ([`EventDispatcher::dispatch_blocking`]) suspend the
//! calling stage until the listener replies, the listener disappears, or the
//! configured timeout fires - the latter two resolve fail-open as
//! [`DispatchOutcome::Proceed`], so a stage is never left suspended forever.
//! Informational dispatches ([`EventDispatcher::dispatch_notify`]) never
//! block stage progression.

use std::time::Duration;

use http::Uri;

use crate::{
    events::{BlockingResponse, EventDetails, EventKind},
    registry::ListenerRegistry,
    request::RequestContext,
};

/// Result of a blocking dispatch, after listener mutations were applied to
/// the [`RequestContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Continue with the (possibly mutated) request.
    Proceed,
    /// The listener supplied a new URL: a direct rewrite for
    /// `beforeRequest`, a listener-authored redirect for `headersReceived`.
    Redirect(Uri),
    /// The listener cancelled the request.
    Cancel,
}

/// Dispatches events for one registry of listeners.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    registry: ListenerRegistry,
    listener_timeout: Option<Duration>,
}

impl EventDispatcher {
    /// `listener_timeout` of [`None`] waits for blocking listeners
    /// indefinitely.
    pub fn new(registry: ListenerRegistry, listener_timeout: Option<Duration>) -> Self {
        Self {
            registry,
            listener_timeout,
        }
    }

    /// Runs the matching listener for a mutating event and applies its reply
    /// to `ctx`.
    ///
    /// Returns [`DispatchOutcome::Proceed`] without suspending when no
    /// listener matches. The state machine never issues two of these
    /// concurrently for one request; the `dispatch_in_flight` flag guards
    /// that contract defensively.
    #[tracing::instrument(
        level = "trace",
        skip(self, ctx, details),
        fields(request_id = ctx.request_id, event = %details.kind()),
    )]
    pub async fn dispatch_blocking(
        &self,
        ctx: &mut RequestContext,
        details: EventDetails,
    ) -> DispatchOutcome {
        let kind = details.kind();
        debug_assert!(kind.is_blocking());

        let Some(callback) = self.registry.find_matching(kind, &ctx.url) else {
            return DispatchOutcome::Proceed;
        };

        if std::mem::replace(&mut ctx.dispatch_in_flight, true) {
            tracing::error!(
                request_id = ctx.request_id,
                event = %kind,
                "second blocking dispatch issued while one is in flight",
            );
            debug_assert!(false, "overlapping blocking dispatches for one request");
        }

        let invocation = callback.invoke_blocking(details.to_wire());
        let reply = match self.listener_timeout {
            None => invocation.await,
            Some(timeout) => match tokio::time::timeout(timeout, invocation).await {
                Ok(reply) => reply,
                Err(..) => {
                    tracing::warn!(
                        request_id = ctx.request_id,
                        event = %kind,
                        ?timeout,
                        "listener did not reply in time, proceeding without it",
                    );
                    None
                }
            },
        };
        ctx.dispatch_in_flight = false;

        let Some(reply) = reply else {
            tracing::trace!(
                request_id = ctx.request_id,
                event = %kind,
                "listener gone mid-invocation, proceeding",
            );
            return DispatchOutcome::Proceed;
        };

        Self::apply_response(kind, ctx, BlockingResponse::from_wire(&reply))
    }

    /// Folds a parsed listener reply into the context.
    fn apply_response(
        kind: EventKind,
        ctx: &mut RequestContext,
        response: BlockingResponse,
    ) -> DispatchOutcome {
        if response.cancel {
            return DispatchOutcome::Cancel;
        }

        match kind {
            EventKind::BeforeRequest => match response.redirect_url {
                Some(url) => DispatchOutcome::Redirect(url),
                None => DispatchOutcome::Proceed,
            },
            EventKind::BeforeSendHeaders => {
                if let Some(headers) = response.request_headers {
                    ctx.request_headers = headers;
                }
                DispatchOutcome::Proceed
            }
            EventKind::HeadersReceived => {
                if let Some(headers) = response.response_headers {
                    ctx.response_headers = Some(headers);
                }
                if let Some(status_line) = response.status_line {
                    ctx.status_line = Some(status_line);
                }
                match response.redirect_url {
                    Some(url) => DispatchOutcome::Redirect(url),
                    None => DispatchOutcome::Proceed,
                }
            }
            kind => {
                debug_assert!(false, "{kind} is not a blocking event");
                DispatchOutcome::Proceed
            }
        }
    }

    /// Fires the matching listener for an informational event, without
    /// waiting for it.
    #[tracing::instrument(
        level = "trace",
        skip(self, ctx, details),
        fields(request_id = ctx.request_id, event = %details.kind()),
    )]
    pub fn dispatch_notify(&self, ctx: &RequestContext, details: EventDetails) {
        debug_assert!(!details.kind().is_blocking());

        if let Some(callback) = self.registry.find_matching(details.kind(), &ctx.url) {
            callback.invoke_notify(details.to_wire());
        }
    }
}
