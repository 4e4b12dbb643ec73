//! Owns the set of live proxied requests.
//!
//! The [`ProxyingFactory`] runs as a [`BackgroundTask`]: the host sends it
//! [`FactoryMessage`]s, and it spawns one
//! [`InProgressRequest`] task per created request. Transport-level header
//! interception callbacks arrive labeled with the transport's own ids, so
//! the factory keeps a `transport id -> request id` mapping next to the
//! request map; entries live and die together.
//!
//! Late events are a fact of life here: the transport may still deliver
//! callbacks for a request that already reached a terminal state and was
//! released. Those are dropped with a log line, never an error.

use std::{collections::HashMap, convert::Infallible, sync::Arc};

use tokio::sync::{mpsc, oneshot};

use self::in_progress::{InProgressRequest, RequestMessage, RequestUpdate};
use crate::{
    background_tasks::{BackgroundTask, BackgroundTasks, MessageBus, TaskSender, TaskUpdate},
    dispatcher::EventDispatcher,
    registry::ListenerRegistry,
    request::{ClientEvent, ProxiedRequest, RequestId},
    transport::{HeaderClientEvent, RequestPriority, Transport, TransportId},
    ProxyConfig,
};

pub mod in_progress;

#[cfg(test)]
mod tests;

/// A request creation call.
///
/// The assigned [`RequestId`] is delivered through `id_reply` as soon as the
/// factory picks the message up; the request itself proceeds asynchronously,
/// delivering its response through `client`. Dropping the receiving end of
/// `client` cancels the request.
#[derive(Debug)]
pub struct CreateRequest {
    pub request: ProxiedRequest,
    pub client: mpsc::Sender<ClientEvent>,
    pub id_reply: oneshot::Sender<RequestId>,
}

/// Messages consumed by [`ProxyingFactory`] running as a [`BackgroundTask`].
#[derive(Debug)]
pub enum FactoryMessage {
    CreateRequest(CreateRequest),
    /// A header interception callback from the transport, labeled with the
    /// transport's id for the exchange.
    HeaderClient(TransportId, HeaderClientEvent),
    SetPriority(RequestId, RequestPriority),
}

struct RequestHandle<T: Transport> {
    tx: TaskSender<InProgressRequest<T>>,
    transport_id: Option<TransportId>,
}

/// Accepts request creation calls from the host and routes transport
/// callbacks to the right request task.
pub struct ProxyingFactory<T: Transport> {
    config: ProxyConfig,
    registry: ListenerRegistry,
    dispatcher: EventDispatcher,
    transport: Arc<T>,
    next_request_id: RequestId,
    /// Sole owner of the live request tasks.
    requests: HashMap<RequestId, RequestHandle<T>>,
    transport_ids: HashMap<TransportId, RequestId>,
    background_tasks: BackgroundTasks<RequestId, RequestUpdate, Infallible>,
}

impl<T: Transport> ProxyingFactory<T> {
    pub fn new(transport: T, registry: ListenerRegistry, config: ProxyConfig) -> Self {
        let config = config.validated();
        let dispatcher = EventDispatcher::new(registry.clone(), config.listener_timeout);

        Self {
            config,
            registry,
            dispatcher,
            transport: Arc::new(transport),
            next_request_id: 1,
            requests: HashMap::new(),
            transport_ids: HashMap::new(),
            background_tasks: Default::default(),
        }
    }

    #[tracing::instrument(level = "trace", skip(self, create))]
    fn handle_create_request(&mut self, create: CreateRequest) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        // Fixed here: a listener registered after this point does not get
        // header visibility into this request.
        let is_using_header_client = self.registry.uses_header_client();

        let task = InProgressRequest::new(
            request_id,
            create.request,
            is_using_header_client,
            self.dispatcher.clone(),
            self.transport.clone(),
            create.client,
        );
        let tx = self
            .background_tasks
            .register(task, request_id, self.config.channel_size);
        self.requests.insert(
            request_id,
            RequestHandle {
                tx,
                transport_id: None,
            },
        );

        let _ = create.id_reply.send(request_id);
        tracing::trace!(request_id, is_using_header_client, "created request");
    }

    async fn route_header_client_event(&self, transport_id: TransportId, event: HeaderClientEvent) {
        let Some(request_id) = self.transport_ids.get(&transport_id).copied() else {
            tracing::warn!(
                transport_id,
                "dropping header interception event for unknown transport id",
            );
            return;
        };

        let Some(handle) = self.requests.get(&request_id) else {
            tracing::warn!(
                transport_id,
                request_id,
                "dropping header interception event for released request",
            );
            return;
        };

        handle.tx.send(RequestMessage::HeaderClient(event)).await;
    }

    async fn set_priority(&self, request_id: RequestId, priority: RequestPriority) {
        let Some(handle) = self.requests.get(&request_id) else {
            tracing::trace!(request_id, "dropping priority change for released request");
            return;
        };

        handle.tx.send(RequestMessage::SetPriority(priority)).await;
    }

    /// Erases the request from both maps. Defensively idempotent: releasing
    /// twice is a contract violation that must not escalate.
    fn release_request(&mut self, request_id: RequestId) {
        let Some(handle) = self.requests.remove(&request_id) else {
            tracing::warn!(request_id, "request released twice");
            return;
        };

        if let Some(transport_id) = handle.transport_id {
            self.transport_ids.remove(&transport_id);
        }
        tracing::trace!(request_id, "released request");
    }
}

impl<T: Transport> BackgroundTask for ProxyingFactory<T> {
    type Error = Infallible;
    type MessageIn = FactoryMessage;
    type MessageOut = Infallible;

    async fn run(mut self, message_bus: &mut MessageBus<Self>) -> Result<(), Self::Error> {
        loop {
            tokio::select! {
                msg = message_bus.recv() => match msg {
                    None => {
                        tracing::trace!("message bus closed, exiting");
                        break Ok(());
                    }
                    Some(FactoryMessage::CreateRequest(create)) => {
                        self.handle_create_request(create);
                    }
                    Some(FactoryMessage::HeaderClient(transport_id, event)) => {
                        self.route_header_client_event(transport_id, event).await;
                    }
                    Some(FactoryMessage::SetPriority(request_id, priority)) => {
                        self.set_priority(request_id, priority).await;
                    }
                },

                Some((request_id, update)) = self.background_tasks.next() => match update {
                    TaskUpdate::Message(RequestUpdate::TransportAssigned(transport_id)) => {
                        self.transport_ids.insert(transport_id, request_id);
                        if let Some(handle) = self.requests.get_mut(&request_id) {
                            handle.transport_id = Some(transport_id);
                        }
                    }
                    TaskUpdate::Finished(result) => {
                        if let Err(error) = result {
                            tracing::error!(request_id, %error, "request task failed");
                        }
                        self.release_request(request_id);
                    }
                },
            }
        }
    }
}
