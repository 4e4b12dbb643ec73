//! The seam between the engine and host-side listener code.
//!
//! A listener is addressed through a [`ListenerHandle`] - a bounded inbox of
//! [`ListenerInvocation`]s consumed by whatever runs the listener logic (an
//! embedded scripting runtime, a plain task, a test). Blocking invocations
//! carry a one-shot reply channel; informational ones carry none.
//!
//! Liveness is encoded in the channels themselves: a dropped inbox or a
//! dropped reply sender means the listener is gone, and the dispatcher
//! resolves the stage fail-open instead of waiting forever.

use std::future::Future;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

/// A single invocation delivered to host-side listener code.
#[derive(Debug)]
pub struct ListenerInvocation {
    /// The details record, in the wire format.
    pub details: Value,
    /// Present for blocking events. The listener's response is sent here;
    /// dropping the sender resolves the dispatch fail-open.
    pub reply: Option<oneshot::Sender<Value>>,
}

/// Opaque handle to host-side listener logic.
///
/// Cheap to clone; all clones feed the same inbox.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    tx: mpsc::Sender<ListenerInvocation>,
}

impl ListenerHandle {
    /// Inbox capacity used by [`ListenerHandle::spawn`].
    const SPAWNED_CHANNEL_SIZE: usize = 64;

    pub fn new(tx: mpsc::Sender<ListenerInvocation>) -> Self {
        Self { tx }
    }

    /// Creates a handle together with the inbox the host should consume.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ListenerInvocation>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Adapts an async closure into a listener by consuming its inbox on a
    /// spawned task. Invocations are processed one at a time, in order.
    pub fn spawn<F, Fut>(mut listener: F) -> Self
    where
        F: FnMut(Value) -> Fut + Send + 'static,
        Fut: Future<Output = Value> + Send,
    {
        let (handle, mut rx) = Self::channel(Self::SPAWNED_CHANNEL_SIZE);

        tokio::spawn(async move {
            while let Some(invocation) = rx.recv().await {
                let response = listener(invocation.details).await;
                if let Some(reply) = invocation.reply {
                    let _ = reply.send(response);
                }
            }
        });

        handle
    }

    /// Sends a blocking invocation and waits for the reply.
    ///
    /// Returns [`None`] when the listener is gone - the inbox is closed, or
    /// the reply sender was dropped without a response.
    pub(crate) async fn invoke_blocking(&self, details: Value) -> Option<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(ListenerInvocation {
                details,
                reply: Some(reply_tx),
            })
            .await
            .ok()?;

        reply_rx.await.ok()
    }

    /// Sends an informational invocation without waiting.
    ///
    /// Must not block stage progression, so a full inbox drops the
    /// notification with a warning.
    pub(crate) fn invoke_notify(&self, details: Value) {
        if let Err(error) = self.tx.try_send(ListenerInvocation {
            details,
            reply: None,
        }) {
            match error {
                mpsc::error::TrySendError::Full(..) => {
                    tracing::warn!("listener inbox full, dropping notification");
                }
                mpsc::error::TrySendError::Closed(..) => {
                    tracing::trace!("listener gone, dropping notification");
                }
            }
        }
    }
}
