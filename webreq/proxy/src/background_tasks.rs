//! Background task plumbing for the interception engine.
//!
//! The engine splits its work across cooperating tasks: the
//! [`ProxyingFactory`](crate::factory::ProxyingFactory) runs as one task and
//! owns one task per in-flight request. Structs in this module manage the
//! lifecycle of such groups and the channels connecting them.
//!
//! Each task implements the [`BackgroundTask`] trait and talks to its owner
//! exclusively through its [`MessageBus`]. Dropping the owner's
//! [`TaskSender`] closes the bus, which is the signal for the task to stop.

use std::{collections::HashMap, fmt, future::Future, hash::Hash};

use thiserror::Error;
use tokio::{
    sync::mpsc::{self, Receiver, Sender},
    task::JoinHandle,
};
use tokio_stream::{wrappers::ReceiverStream, StreamExt, StreamMap, StreamNotifyClose};

/// The only way a [`BackgroundTask`] communicates with its owner.
pub struct MessageBus<T: BackgroundTask> {
    tx: Sender<T::MessageOut>,
    rx: Receiver<T::MessageIn>,
}

impl<T: BackgroundTask> MessageBus<T> {
    /// Attempts to send a message to this task's owner.
    pub async fn send<M: Into<T::MessageOut>>(&self, msg: M) {
        let _ = self.tx.send(msg.into()).await;
    }

    /// Receives a message from this task's owner.
    /// [`None`] means that the bus is closed and the task should stop.
    pub async fn recv(&mut self) -> Option<T::MessageIn> {
        tokio::select! {
            _ = self.tx.closed() => None,
            msg = self.rx.recv() => msg,
        }
    }

    /// Returns a [`Closed`] instance for this [`MessageBus`].
    pub(crate) fn closed(&self) -> Closed<T> {
        Closed(self.tx.clone())
    }
}

/// A standalone handle observing closure of some [`MessageBus`].
///
/// Request tasks suspend on listener replies and transport events. Those
/// awaits must not outlive the owning factory's interest in the request, so
/// they are raced against this signal. The handle holds no borrow of the
/// bus, which keeps it usable in the same `select!` as bus operations.
pub(crate) struct Closed<T: BackgroundTask>(Sender<T::MessageOut>);

impl<T: BackgroundTask> Closed<T> {
    /// Resolves when the origin [`MessageBus`] is closed.
    pub(crate) async fn wait(&self) {
        self.0.closed().await
    }
}

/// Common trait for all background tasks in the interception engine.
pub trait BackgroundTask: Sized {
    /// Type of errors that can occur during the execution.
    type Error;
    /// Type of messages consumed by the task.
    type MessageIn;
    /// Type of messages produced by the task.
    type MessageOut;

    /// Runs this task.
    /// When the [`MessageBus`] has no more messages to be consumed, the task
    /// should exit without errors.
    fn run(
        self,
        message_bus: &mut MessageBus<Self>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// A struct for managing groups of related [`BackgroundTask`]s.
/// Tasks managed with a single instance of this struct must produce messages
/// of the same type `MOut` and return errors convertible to `Err`.
pub struct BackgroundTasks<Id, MOut, Err> {
    streams: StreamMap<Id, StreamNotifyClose<ReceiverStream<MOut>>>,
    handles: HashMap<Id, JoinHandle<Result<(), Err>>>,
}

impl<Id, MOut, Err> Default for BackgroundTasks<Id, MOut, Err> {
    fn default() -> Self {
        Self {
            streams: Default::default(),
            handles: Default::default(),
        }
    }
}

impl<Id, MOut, Err> BackgroundTasks<Id, MOut, Err>
where
    Id: fmt::Debug + Hash + PartialEq + Eq + Clone + Unpin,
    Err: 'static + Send,
    MOut: Send + Unpin,
{
    /// Spawns the given task and registers it under the given id. Returns a
    /// [`TaskSender`] for sending messages to the task. Dropping the sender
    /// closes the task's [`MessageBus`], which should trigger task exit.
    ///
    /// # Panics
    ///
    /// This method panics when attempting to register a task with a
    /// duplicate id.
    pub fn register<T>(&mut self, task: T, id: Id, channel_size: usize) -> TaskSender<T>
    where
        T: 'static + BackgroundTask<MessageOut = MOut> + Send,
        Err: From<T::Error>,
        T::MessageIn: Send,
    {
        if self.streams.contains_key(&id) {
            panic!("duplicate task id {id:?}");
        }

        let (in_msg_tx, in_msg_rx) = mpsc::channel(channel_size);
        let (out_msg_tx, out_msg_rx) = mpsc::channel(channel_size);

        self.streams.insert(
            id.clone(),
            StreamNotifyClose::new(ReceiverStream::new(out_msg_rx)),
        );

        let mut message_bus = MessageBus {
            tx: out_msg_tx,
            rx: in_msg_rx,
        };

        self.handles.insert(
            id.clone(),
            tokio::spawn(async move { task.run(&mut message_bus).await.map_err(Into::into) }),
        );

        TaskSender(in_msg_tx)
    }

    /// Returns the next update from one of the registered tasks.
    pub async fn next(&mut self) -> Option<(Id, TaskUpdate<MOut, Err>)> {
        let (id, msg) = self.streams.next().await?;

        let msg = match msg {
            Some(msg) => (id, TaskUpdate::Message(msg)),
            None => {
                let res = self
                    .handles
                    .remove(&id)
                    .expect("task handles and streams are out of sync")
                    .await;
                match res {
                    Err(error) => {
                        tracing::error!(?error, "task panicked");
                        (id, TaskUpdate::Finished(Err(TaskError::Panic)))
                    }
                    Ok(res) => (id, TaskUpdate::Finished(res.map_err(TaskError::Error))),
                }
            }
        };

        Some(msg)
    }
}

/// An error that can occur when executing a [`BackgroundTask`].
#[derive(Debug, Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum TaskError<Err> {
    /// An internal task error.
    #[error(transparent)]
    Error(Err),
    /// A panic.
    #[error("task panicked")]
    Panic,
}

/// An update received from a [`BackgroundTask`] registered in the
/// [`BackgroundTasks`] struct.
#[derive(Debug)]
pub enum TaskUpdate<MOut, Err> {
    /// The task produced a message.
    Message(MOut),
    /// The task finished and was deregistered.
    Finished(Result<(), TaskError<Err>>),
}

/// A struct that can be used to send messages to a [`BackgroundTask`]
/// registered in the [`BackgroundTasks`] struct. Dropping this sender closes
/// the channel of messages consumed by the task (see [`MessageBus`]). This
/// should trigger task exit.
pub struct TaskSender<T: BackgroundTask>(Sender<T::MessageIn>);

impl<T: BackgroundTask> TaskSender<T> {
    /// Attempt to send a message to the task.
    pub async fn send<M: Into<T::MessageIn>>(&self, msg: M) {
        let _ = self.0.send(msg.into()).await;
    }
}
