//! Units of work shipped into contexts.
//!
//! A [`Task`] crosses the wire as a [`TaskEnvelope`]: its registry name plus its
//! serde payload. The receiving context resolves the name through a
//! [`TaskRegistry`]; names it does not know fail with
//! [`UNRESOLVABLE_KIND`] instead of being guessed at.

pub mod diagnostic;
mod registry;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use registry::{ErasedTask, TaskRegistry};

pub use crate::bridge::protocol::TaskEnvelope;
use crate::bridge::{ChannelError, SerializationError};
use crate::exit::Failure;

/// Failure kind for envelopes naming a task the context has not registered.
pub const UNRESOLVABLE_KIND: &str = "ferry::UnresolvableTask";
/// Failure kind for tasks that stopped because they observed cancellation.
pub const CANCELLED_KIND: &str = "ferry::Cancelled";
/// Failure kind for task outputs that could not be serialized.
pub const OUTPUT_KIND: &str = "ferry::OutputSerialization";

/// A unit of work that can run inside any execution context.
///
/// Implementors are plain serde types. `NAME` must be unique within a registry
/// and identical on both sides of the channel.
#[async_trait]
pub trait Task: Serialize + DeserializeOwned + Send + 'static {
    const NAME: &'static str;

    type Output: Serialize + DeserializeOwned + Send + 'static;

    async fn run(
        self,
        channel: TaskChannel,
        cancel: CancellationToken,
    ) -> Result<Self::Output, Failure>;
}

/// Serialize a task into its wire form.
pub fn envelope<T: Task>(task: &T) -> Result<TaskEnvelope, SerializationError> {
    Ok(TaskEnvelope {
        name: T::NAME.to_string(),
        payload: serde_json::to_value(task)?,
    })
}

impl Failure {
    /// Failure reported by a task that stopped on cancellation.
    #[track_caller]
    pub fn cancelled() -> Self {
        Self::new(CANCELLED_KIND, "the task was cancelled")
    }

    pub fn is_cancellation(&self) -> bool {
        self.kind == CANCELLED_KIND
    }
}

/// A task's view of its channel: in-task messages to and from the submitter.
///
/// Sends never block; messages are queued and written in order, before the
/// task's final result.
pub struct TaskChannel {
    inbound: mpsc::UnboundedReceiver<serde_json::Value>,
    outbound: mpsc::UnboundedSender<serde_json::Value>,
}

impl TaskChannel {
    pub fn new(
        inbound: mpsc::UnboundedReceiver<serde_json::Value>,
        outbound: mpsc::UnboundedSender<serde_json::Value>,
    ) -> Self {
        Self { inbound, outbound }
    }

    /// Two channels wired to each other, for running tasks in-process.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_rx, b_tx), Self::new(b_rx, a_tx))
    }

    pub fn send<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), ChannelError> {
        let value = serde_json::to_value(value).map_err(SerializationError::from)?;
        self.outbound.send(value).map_err(|_| ChannelError::Closed)
    }

    pub async fn receive<T: DeserializeOwned>(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<T, ChannelError> {
        let value = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
            value = self.inbound.recv() => value.ok_or(ChannelError::Disconnected)?,
        };
        Ok(serde_json::from_value(value).map_err(SerializationError::from)?)
    }

    /// A cloneable send-only handle, e.g. for helper tasks spawned by the task.
    pub fn sender(&self) -> TaskSender {
        TaskSender {
            outbound: self.outbound.clone(),
        }
    }
}

#[derive(Clone)]
pub struct TaskSender {
    outbound: mpsc::UnboundedSender<serde_json::Value>,
}

impl TaskSender {
    pub fn send<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), ChannelError> {
        let value = serde_json::to_value(value).map_err(SerializationError::from)?;
        self.outbound.send(value).map_err(|_| ChannelError::Closed)
    }
}
