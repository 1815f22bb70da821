//! ferry: run tasks in isolated processes, threads, or runtime tasks.

mod fd_redirect;

pub mod bridge;
pub mod config;
pub mod context;
pub mod exit;
pub mod host;
pub mod hub;
pub mod logging;
pub mod pool;
pub mod runner;
pub mod sync;
pub mod task;
pub mod worker;

pub use tokio_util::sync::CancellationToken;

pub use bridge::{Channel, ChannelError, SerializationError};
pub use context::{
    BackendKind, ContextConfig, ContextError, ContextFactory, ContextState, ExecutionContext,
    StatusError,
};
pub use exit::{ExitResult, Failure};
pub use hub::{Hub, HubConfig, HubError, HubKey, HubUri};
pub use pool::{ContextWorkerFactory, PoolConfig, PoolError, WorkerFactory, WorkerPool};
pub use sync::{Lock, LockError, Mutex, Parcel, Semaphore, SyncError};
pub use task::{Task, TaskChannel, TaskEnvelope, TaskRegistry};
pub use worker::{Execution, ExecutionError, Worker, WorkerConfig, WorkerError};

/// Run `task` as the entry of a fresh context and wait for its output.
pub async fn run<T: Task>(factory: &ContextFactory, task: &T) -> Result<T::Output, ContextError> {
    let context = factory.create(task)?;
    context.start().await?;
    let value = context.join(&CancellationToken::new()).await?;
    Ok(serde_json::from_value(value).map_err(SerializationError::from)?)
}
