//! The per-request state machine.
//!
//! One [`InProgressRequest`] is run as a
//! [`BackgroundTask`] by the [`ProxyingFactory`](super::ProxyingFactory) for
//! every proxied request. It drives the request through the ordered
//! interception stages, applies listener-supplied mutations, forwards the
//! exchange to and from the transport, and restarts the listener pipeline on
//! redirects.
//!
//! Stage ordering is enforced structurally: every blocking dispatch is
//! awaited inline before the next transition, so no two blocking dispatches
//! for one request can ever overlap. The [`RequestState`] tag makes each
//! transition explicit and checkable.
//!
//! Cancellation has three sources, and whichever fires first wins exactly
//! once (guarded by the completion flag on the context): a listener
//! cancelling a blocking stage, the transport reporting an error, or the
//! original caller disconnecting. The last one fires no further events - the
//! task aborts the transport exchange and exits.

use std::{convert::Infallible, ops::ControlFlow, sync::Arc};

use http::{header::HeaderName, HeaderMap, Uri};
use tokio::sync::mpsc;

use crate::{
    background_tasks::{BackgroundTask, Closed, MessageBus},
    dispatcher::{DispatchOutcome, EventDispatcher},
    error::NetError,
    events::EventDetails,
    request::{ClientEvent, ProxiedRequest, RequestContext, RequestId},
    transport::{
        ConnectRequest, HeaderClientEvent, HeaderClientVerdict, HeaderOverrides, RequestPriority,
        Transport, TransportConnection, TransportEvent, TransportError, TransportId,
    },
};

/// Messages consumed by an [`InProgressRequest`], routed by the factory.
#[derive(Debug)]
pub enum RequestMessage {
    /// A header interception callback from the transport.
    HeaderClient(HeaderClientEvent),
    /// The caller changed the scheduling priority of this request.
    SetPriority(RequestPriority),
}

/// Updates produced by an [`InProgressRequest`] for the factory.
#[derive(Debug, Clone, Copy)]
pub enum RequestUpdate {
    /// The transport accepted the exchange and assigned its own id to it.
    TransportAssigned(TransportId),
}

/// Stage tag of one proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Created,
    AwaitingBeforeRequest,
    AwaitingBeforeSendHeaders,
    Started,
    AwaitingHeadersReceived,
    ResponseStreaming,
    Completed,
    Errored,
}

impl RequestState {
    /// Legal transitions. Header interception callbacks re-enter
    /// `AwaitingHeadersReceived` from `Started`; redirects re-enter
    /// `AwaitingBeforeRequest`.
    fn can_advance_to(self, next: Self) -> bool {
        use RequestState::*;

        matches!(
            (self, next),
            (Created, AwaitingBeforeRequest)
                | (AwaitingBeforeRequest, AwaitingBeforeSendHeaders)
                | (AwaitingBeforeSendHeaders, Started)
                | (Started, AwaitingHeadersReceived)
                | (Started, AwaitingBeforeRequest)
                | (Started, ResponseStreaming)
                | (AwaitingHeadersReceived, Started)
                | (AwaitingHeadersReceived, ResponseStreaming)
                | (AwaitingHeadersReceived, AwaitingBeforeRequest)
                | (_, Completed)
                | (_, Errored)
        )
    }
}

/// Why the task is winding down without a terminal event.
enum Interrupt {
    /// The factory dropped this task's sender.
    Released,
    /// The original caller disconnected. No further events fire.
    ClientGone,
}

/// Drives one proxied request from creation to a terminal state.
pub struct InProgressRequest<T> {
    ctx: RequestContext,
    dispatcher: EventDispatcher,
    transport: Arc<T>,
    client_tx: mpsc::Sender<ClientEvent>,
    follow_redirects: bool,
    state: RequestState,
}

impl<T: Transport> InProgressRequest<T> {
    pub fn new(
        request_id: RequestId,
        request: ProxiedRequest,
        is_using_header_client: bool,
        dispatcher: EventDispatcher,
        transport: Arc<T>,
        client_tx: mpsc::Sender<ClientEvent>,
    ) -> Self {
        let follow_redirects = request.follow_redirects;
        Self {
            ctx: RequestContext::new(request_id, &request, is_using_header_client),
            dispatcher,
            transport,
            client_tx,
            follow_redirects,
            state: RequestState::Created,
        }
    }

    fn transition(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal request state transition {:?} -> {next:?}",
            self.state,
        );
        tracing::trace!(
            request_id = self.ctx.request_id,
            from = ?self.state,
            to = ?next,
            "request state transition",
        );
        self.state = next;
    }

    /// Runs one blocking dispatch, bailing out if the caller disconnects or
    /// the factory releases this request while the listener is thinking.
    async fn guarded_dispatch(
        &mut self,
        closed: &Closed<Self>,
        details: EventDetails,
    ) -> Result<DispatchOutcome, Interrupt> {
        tokio::select! {
            outcome = self.dispatcher.dispatch_blocking(&mut self.ctx, details) => Ok(outcome),
            _ = self.client_tx.closed() => Err(Interrupt::ClientGone),
            _ = closed.wait() => Err(Interrupt::Released),
        }
    }

    fn notify_send_headers(&self) {
        let details = self.ctx.send_headers_details();
        self.dispatcher.dispatch_notify(&self.ctx, details);
    }

    /// Terminal failure: notifies `errorOccurred` listeners and the caller.
    /// Runs at most once per request.
    async fn fail(&mut self, error: NetError) {
        if !self.ctx.mark_completed() {
            return;
        }
        self.transition(RequestState::Errored);

        let details = self.ctx.error_details(&error);
        self.dispatcher.dispatch_notify(&self.ctx, details);
        let _ = self.client_tx.send(ClientEvent::Failed(error)).await;
    }

    /// Terminal success: notifies `completed` listeners and the caller.
    /// Runs at most once per request.
    async fn complete(&mut self) {
        if !self.ctx.mark_completed() {
            return;
        }
        self.transition(RequestState::Completed);

        let details = self.ctx.completed_details();
        self.dispatcher.dispatch_notify(&self.ctx, details);
        let _ = self.client_tx.send(ClientEvent::Completed).await;
    }

    /// Re-runs the listener pipeline for a redirect and resumes the
    /// transport exchange.
    ///
    /// `forced` marks a listener-authored target (independent of the
    /// response's declared redirect), which the transport must be told about
    /// explicitly.
    ///
    /// Returns [`ControlFlow::Break`] when the redirect terminated the
    /// request instead.
    async fn restart_for_redirect(
        &mut self,
        closed: &Closed<Self>,
        conn: &mut TransportConnection,
        target: Uri,
        forced: bool,
    ) -> Result<ControlFlow<()>, Interrupt> {
        self.ctx.reset_for_redirect(target);
        let declared = self.ctx.url.clone();

        self.transition(RequestState::AwaitingBeforeRequest);
        let details = self.ctx.before_request_details();
        match self.guarded_dispatch(closed, details).await? {
            DispatchOutcome::Cancel => {
                conn.handle.abort();
                self.fail(NetError::BlockedByClient).await;
                return Ok(ControlFlow::Break(()));
            }
            DispatchOutcome::Redirect(url) => self.ctx.url = url,
            DispatchOutcome::Proceed => {}
        }

        self.transition(RequestState::AwaitingBeforeSendHeaders);
        let headers_before = self.ctx.request_headers.clone();
        let details = self.ctx.before_send_headers_details();
        if let DispatchOutcome::Cancel = self.guarded_dispatch(closed, details).await? {
            conn.handle.abort();
            self.fail(NetError::BlockedByClient).await;
            return Ok(ControlFlow::Break(()));
        }
        let (removed_headers, modified_headers) =
            header_diff(&headers_before, &self.ctx.request_headers);

        self.transition(RequestState::Started);
        let new_url = (forced || self.ctx.url != declared).then(|| self.ctx.url.clone());
        conn.handle
            .follow_redirect(removed_headers, modified_headers, new_url);
        if !self.ctx.is_using_header_client {
            self.notify_send_headers();
        }

        Ok(ControlFlow::Continue(()))
    }

    /// Answers a header interception callback by running the matching
    /// blocking stage.
    ///
    /// Returns [`ControlFlow::Break`] when the stage cancelled the request.
    /// A `headersReceived` listener may also author a redirect; the target
    /// is returned to be honored once the transport echoes the final
    /// headers.
    async fn handle_header_client_event(
        &mut self,
        closed: &Closed<Self>,
        conn: &mut TransportConnection,
        event: HeaderClientEvent,
        awaiting_send_headers: &mut bool,
        headers_dispatched: &mut bool,
        pending_unsafe_redirect: &mut Option<Uri>,
    ) -> Result<ControlFlow<()>, Interrupt> {
        match event {
            HeaderClientEvent::BeforeSendHeaders { reply, .. } => {
                // The blocking stage already ran before the exchange was
                // opened; the transport just needs the negotiated headers.
                let _ = reply.send(HeaderClientVerdict::Proceed(HeaderOverrides {
                    headers: Some(self.ctx.request_headers.clone()),
                    status_line: None,
                }));
                if std::mem::take(awaiting_send_headers) {
                    self.notify_send_headers();
                }
            }
            HeaderClientEvent::HeadersReceived {
                status,
                status_line,
                headers,
                reply,
            } => {
                self.transition(RequestState::AwaitingHeadersReceived);
                self.ctx.status_code = Some(status);
                self.ctx.status_line = status_line;
                self.ctx.response_headers = Some(headers);

                let details = self.ctx.headers_received_details();
                let outcome = self.guarded_dispatch(closed, details).await?;
                if let DispatchOutcome::Cancel = outcome {
                    let _ = reply.send(HeaderClientVerdict::Cancel);
                    conn.handle.abort();
                    self.fail(NetError::BlockedByClient).await;
                    return Ok(ControlFlow::Break(()));
                }

                if let DispatchOutcome::Redirect(url) = outcome {
                    *pending_unsafe_redirect = Some(url);
                }
                let _ = reply.send(HeaderClientVerdict::Proceed(HeaderOverrides {
                    headers: self.ctx.response_headers.clone(),
                    status_line: self.ctx.status_line.clone(),
                }));
                *headers_dispatched = true;
                self.transition(RequestState::Started);
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    /// Consumes transport events and routed messages until the exchange
    /// reaches a terminal state.
    async fn stream(
        &mut self,
        message_bus: &mut MessageBus<Self>,
        closed: &Closed<Self>,
        conn: &mut TransportConnection,
    ) -> Result<(), Interrupt> {
        // Per-hop bookkeeping for header interception mode: whether the
        // `sendHeaders` notification is still owed, and whether the
        // `headersReceived` stage already ran through the header client.
        let mut awaiting_send_headers = self.ctx.is_using_header_client;
        let mut headers_dispatched = false;
        let mut pending_unsafe_redirect: Option<Uri> = None;

        loop {
            tokio::select! {
                _ = self.client_tx.closed() => return Err(Interrupt::ClientGone),

                msg = message_bus.recv() => match msg {
                    None => return Err(Interrupt::Released),
                    Some(RequestMessage::SetPriority(priority)) => {
                        conn.handle.set_priority(priority);
                    }
                    Some(RequestMessage::HeaderClient(event)) => {
                        let flow = self
                            .handle_header_client_event(
                                closed,
                                conn,
                                event,
                                &mut awaiting_send_headers,
                                &mut headers_dispatched,
                                &mut pending_unsafe_redirect,
                            )
                            .await?;
                        if flow.is_break() {
                            return Ok(());
                        }
                    }
                },

                event = conn.events.recv() => match event {
                    None => {
                        self.fail(TransportError::StreamClosed.into()).await;
                        return Ok(());
                    }

                    Some(TransportEvent::Redirect { target, status, headers }) => {
                        self.ctx.status_code = Some(status);
                        self.ctx.response_headers = Some(headers);
                        self.ctx.redirect_url = Some(target.clone());

                        let details = self.ctx.before_redirect_details(&target);
                        self.dispatcher.dispatch_notify(&self.ctx, details);

                        if self.follow_redirects && !self.ctx.is_using_header_client {
                            // The caller asked for transparent redirect
                            // handling and no listener needs the hop.
                            self.ctx.reset_for_redirect(target);
                            conn.handle.follow_redirect(Vec::new(), HeaderMap::new(), None);
                            self.notify_send_headers();
                        } else if self
                            .restart_for_redirect(closed, conn, target, false)
                            .await?
                            .is_break()
                        {
                            return Ok(());
                        }

                        awaiting_send_headers = self.ctx.is_using_header_client;
                        headers_dispatched = false;
                        pending_unsafe_redirect = None;
                    }

                    Some(TransportEvent::Headers { status, headers }) => {
                        if let Some(target) = pending_unsafe_redirect.take() {
                            // Listener-authored redirect from the
                            // `headersReceived` stage.
                            self.ctx.redirect_url = Some(target.clone());
                            let details = self.ctx.before_redirect_details(&target);
                            self.dispatcher.dispatch_notify(&self.ctx, details);
                            if self
                                .restart_for_redirect(closed, conn, target, true)
                                .await?
                                .is_break()
                            {
                                return Ok(());
                            }
                            awaiting_send_headers = self.ctx.is_using_header_client;
                            headers_dispatched = false;
                            continue;
                        }

                        self.ctx.status_code = Some(status);
                        self.ctx.response_headers = Some(headers);

                        if !headers_dispatched {
                            self.transition(RequestState::AwaitingHeadersReceived);
                            let details = self.ctx.headers_received_details();
                            match self.guarded_dispatch(closed, details).await? {
                                DispatchOutcome::Cancel => {
                                    conn.handle.abort();
                                    self.fail(NetError::BlockedByClient).await;
                                    return Ok(());
                                }
                                DispatchOutcome::Redirect(target) => {
                                    self.ctx.redirect_url = Some(target.clone());
                                    let details = self.ctx.before_redirect_details(&target);
                                    self.dispatcher.dispatch_notify(&self.ctx, details);
                                    if self
                                        .restart_for_redirect(closed, conn, target, true)
                                        .await?
                                        .is_break()
                                    {
                                        return Ok(());
                                    }
                                    awaiting_send_headers = self.ctx.is_using_header_client;
                                    headers_dispatched = false;
                                    continue;
                                }
                                DispatchOutcome::Proceed => {}
                            }
                        }

                        self.transition(RequestState::ResponseStreaming);
                        let details = self.ctx.response_started_details();
                        self.dispatcher.dispatch_notify(&self.ctx, details);

                        let started = ClientEvent::ResponseStarted {
                            status: self.ctx.status_code.unwrap_or(status),
                            status_line: self.ctx.status_line.clone(),
                            headers: self.ctx.response_headers.clone().unwrap_or_default(),
                        };
                        if self.client_tx.send(started).await.is_err() {
                            return Err(Interrupt::ClientGone);
                        }
                    }

                    Some(TransportEvent::BodyData(bytes)) => {
                        if self.client_tx.send(ClientEvent::BodyData(bytes)).await.is_err() {
                            return Err(Interrupt::ClientGone);
                        }
                    }

                    Some(TransportEvent::Completed(Ok(()))) => {
                        self.complete().await;
                        return Ok(());
                    }

                    Some(TransportEvent::Completed(Err(error))) => {
                        self.fail(error.into()).await;
                        return Ok(());
                    }
                },
            }
        }
    }

    /// The whole pipeline: listener stages, transport connect, streaming.
    async fn proxy(
        &mut self,
        message_bus: &mut MessageBus<Self>,
        closed: &Closed<Self>,
    ) -> Result<(), Interrupt> {
        self.transition(RequestState::AwaitingBeforeRequest);
        let details = self.ctx.before_request_details();
        match self.guarded_dispatch(closed, details).await? {
            DispatchOutcome::Cancel => {
                self.fail(NetError::BlockedByClient).await;
                return Ok(());
            }
            DispatchOutcome::Redirect(url) => {
                // A direct rewrite: the stage is not re-entered for the new
                // URL.
                tracing::trace!(
                    request_id = self.ctx.request_id,
                    url = %url,
                    "listener rewrote the request URL",
                );
                self.ctx.url = url;
            }
            DispatchOutcome::Proceed => {}
        }

        self.transition(RequestState::AwaitingBeforeSendHeaders);
        let details = self.ctx.before_send_headers_details();
        if let DispatchOutcome::Cancel = self.guarded_dispatch(closed, details).await? {
            self.fail(NetError::BlockedByClient).await;
            return Ok(());
        }

        self.transition(RequestState::Started);
        let connect = ConnectRequest {
            url: self.ctx.url.clone(),
            method: self.ctx.method.clone(),
            headers: self.ctx.request_headers.clone(),
            expose_header_client: self.ctx.is_using_header_client,
        };
        let connected = tokio::select! {
            connected = self.transport.connect(connect) => connected,
            _ = self.client_tx.closed() => return Err(Interrupt::ClientGone),
            _ = closed.wait() => return Err(Interrupt::Released),
        };
        let mut conn = match connected {
            Ok(conn) => conn,
            Err(error) => {
                self.fail(error.into()).await;
                return Ok(());
            }
        };
        message_bus
            .send(RequestUpdate::TransportAssigned(conn.transport_id))
            .await;

        if !self.ctx.is_using_header_client {
            // In header interception mode this fires once the transport has
            // asked for (and received) the final request headers.
            self.notify_send_headers();
        }

        let streamed = self.stream(message_bus, closed, &mut conn).await;
        if streamed.is_err() {
            conn.handle.abort();
        }
        streamed
    }
}

impl<T: Transport> BackgroundTask for InProgressRequest<T> {
    type Error = Infallible;
    type MessageIn = RequestMessage;
    type MessageOut = RequestUpdate;

    async fn run(mut self, message_bus: &mut MessageBus<Self>) -> Result<(), Self::Error> {
        let closed = message_bus.closed();

        match self.proxy(message_bus, &closed).await {
            Ok(()) => {}
            Err(Interrupt::ClientGone) => {
                tracing::trace!(
                    request_id = self.ctx.request_id,
                    "caller disconnected, dropping request without further events",
                );
            }
            Err(Interrupt::Released) => {
                tracing::trace!(request_id = self.ctx.request_id, "request released");
            }
        }

        Ok(())
    }
}

/// Computes the removed/modified header lists the transport expects when
/// resuming a redirect.
fn header_diff(before: &HeaderMap, after: &HeaderMap) -> (Vec<HeaderName>, HeaderMap) {
    let removed = before
        .keys()
        .filter(|name| !after.contains_key(*name))
        .cloned()
        .collect();

    let mut modified = HeaderMap::new();
    for name in after.keys() {
        let changed = !before
            .get_all(name)
            .iter()
            .eq(after.get_all(name).iter());
        if changed {
            for value in after.get_all(name) {
                modified.append(name.clone(), value.clone());
            }
        }
    }

    (removed, modified)
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn header_diff_reports_removed_and_changed() {
        let mut before = HeaderMap::new();
        before.insert("x-keep", HeaderValue::from_static("1"));
        before.insert("x-drop", HeaderValue::from_static("2"));
        before.insert("x-change", HeaderValue::from_static("old"));

        let mut after = HeaderMap::new();
        after.insert("x-keep", HeaderValue::from_static("1"));
        after.insert("x-change", HeaderValue::from_static("new"));
        after.insert("x-add", HeaderValue::from_static("3"));

        let (removed, modified) = header_diff(&before, &after);

        assert_eq!(removed, vec![HeaderName::from_static("x-drop")]);
        assert_eq!(modified.len(), 2);
        assert_eq!(modified["x-change"], "new");
        assert_eq!(modified["x-add"], "3");
    }
}
