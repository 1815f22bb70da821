//! Runtime backend: the host runs as a task on the caller's tokio runtime.
//!
//! The cheapest context. It shares the parent's address space and scheduler;
//! kill aborts the task at its next await point.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::{ContextError, ContextFactory, ContextHandle, Launched, Termination};
use crate::bridge::Channel;
use crate::bridge::protocol::TaskEnvelope;
use crate::exit::Failure;
use crate::host;

static NEXT_TASK: AtomicU64 = AtomicU64::new(1);

pub(super) fn launch(
    factory: &ContextFactory,
    entry: TaskEnvelope,
) -> Result<Launched, ContextError> {
    let (parent_end, context_end) = tokio::io::duplex(factory.config().buffer_size);
    let id = NEXT_TASK.fetch_add(1, Ordering::Relaxed);
    let (done_tx, termination) = Termination::channel();

    let registry = Arc::clone(factory.registry());
    let task = tokio::spawn(host::serve(
        Channel::new(context_end),
        entry,
        registry,
        CancellationToken::new(),
    ));
    let abort = task.abort_handle();

    tokio::spawn(async move {
        let reason = match task.await {
            Ok(Ok(result)) if result.is_success() => "task finished".to_string(),
            Ok(Ok(_)) => "task finished with a failure".to_string(),
            Ok(Err(e)) => format!("task lost its channel: {e}"),
            Err(e) if e.is_cancelled() => "task aborted".to_string(),
            Err(e) => format!("task panicked: {}", Failure::from_panic(e.into_panic()).message),
        };
        let _ = done_tx.send(Some(reason));
    });

    tracing::debug!(task = id, "Context task spawned");
    Ok(Launched {
        channel: Channel::new(parent_end),
        handle: Arc::new(RuntimeHandle {
            id,
            abort,
            termination,
        }),
    })
}

#[derive(Debug)]
struct RuntimeHandle {
    id: u64,
    abort: AbortHandle,
    termination: Termination,
}

#[async_trait]
impl ContextHandle for RuntimeHandle {
    fn describe(&self) -> String {
        format!("task {}", self.id)
    }

    fn kill(&self) {
        self.abort.abort();
    }

    fn is_alive(&self) -> bool {
        !self.termination.is_done()
    }

    async fn termination(&self) -> String {
        self.termination.wait().await
    }
}
