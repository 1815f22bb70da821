//! Name → decoder table resolving task envelopes inside a context.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{OUTPUT_KIND, Task, TaskChannel, TaskEnvelope, UNRESOLVABLE_KIND};
use crate::exit::Failure;
use crate::runner::{RUNNER_NAME, TaskRunner};

/// A decoded task with its concrete type erased.
#[async_trait]
pub trait ErasedTask: Send {
    async fn run(
        self: Box<Self>,
        channel: TaskChannel,
        cancel: CancellationToken,
        registry: Arc<TaskRegistry>,
    ) -> Result<serde_json::Value, Failure>;
}

struct Erased<T>(T);

#[async_trait]
impl<T: Task> ErasedTask for Erased<T> {
    async fn run(
        self: Box<Self>,
        channel: TaskChannel,
        cancel: CancellationToken,
        _registry: Arc<TaskRegistry>,
    ) -> Result<serde_json::Value, Failure> {
        let output = self.0.run(channel, cancel).await?;
        serde_json::to_value(output).map_err(|e| {
            Failure::new(
                OUTPUT_KIND,
                format!("output of task `{}` is not serializable: {e}", T::NAME),
            )
        })
    }
}

type Decoder =
    Box<dyn Fn(serde_json::Value) -> Result<Box<dyn ErasedTask>, serde_json::Error> + Send + Sync>;

/// Registry of task types a context can run.
///
/// Always contains the worker task runner.
pub struct TaskRegistry {
    decoders: HashMap<String, Decoder>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            decoders: HashMap::new(),
        };
        registry.insert(RUNNER_NAME, |payload| {
            let runner: TaskRunner = serde_json::from_value(payload)?;
            Ok(Box::new(runner) as Box<dyn ErasedTask>)
        });
        registry
    }

    /// Registry with the built-in diagnostic tasks.
    pub fn with_diagnostics() -> Self {
        let mut registry = Self::new();
        super::diagnostic::register(&mut registry);
        registry
    }

    pub fn register<T: Task>(&mut self) -> &mut Self {
        self.insert(T::NAME, |payload| {
            let task: T = serde_json::from_value(payload)?;
            Ok(Box::new(Erased(task)) as Box<dyn ErasedTask>)
        })
    }

    fn insert<F>(&mut self, name: &str, decoder: F) -> &mut Self
    where
        F: Fn(serde_json::Value) -> Result<Box<dyn ErasedTask>, serde_json::Error>
            + Send
            + Sync
            + 'static,
    {
        if self.decoders.insert(name.to_string(), Box::new(decoder)).is_some() {
            tracing::warn!(task = name, "Task registered twice; keeping the latest decoder");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.decoders.keys().map(String::as_str)
    }

    /// Decode an envelope into a runnable task.
    #[track_caller]
    pub fn resolve(&self, envelope: TaskEnvelope) -> Result<Box<dyn ErasedTask>, Failure> {
        let Some(decoder) = self.decoders.get(&envelope.name) else {
            return Err(Failure::new(
                UNRESOLVABLE_KIND,
                format!(
                    "task type `{}` is not registered in this context",
                    envelope.name
                ),
            ));
        };
        decoder(envelope.payload).map_err(|e| {
            Failure::new(
                UNRESOLVABLE_KIND,
                format!("payload for task `{}` does not decode: {e}", envelope.name),
            )
        })
    }

    /// Resolve and run an envelope to completion.
    pub async fn run(
        self: &Arc<Self>,
        envelope: TaskEnvelope,
        channel: TaskChannel,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, Failure> {
        let task = self.resolve(envelope)?;
        task.run(channel, cancel, Arc::clone(self)).await
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("TaskRegistry").field("tasks", &names).finish()
    }
}
