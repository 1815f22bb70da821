//! Thread backend: a dedicated OS thread running its own single-threaded
//! runtime, wired to the parent through an in-memory duplex stream.
//!
//! Killing is cooperative: the thread's runtime is torn down at the next await
//! point of the hosted task. Code that blocks without yielding keeps the thread
//! alive until it returns, although the context itself is already `Killed`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

use super::{ContextError, ContextFactory, ContextHandle, Launched, Termination};
use crate::bridge::Channel;
use crate::bridge::protocol::TaskEnvelope;
use crate::exit::Failure;
use crate::host;
use crate::task::TaskRegistry;

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);

pub(super) fn launch(
    factory: &ContextFactory,
    entry: TaskEnvelope,
) -> Result<Launched, ContextError> {
    let (parent_end, context_end) = tokio::io::duplex(factory.config().buffer_size);
    let name = format!("ferry-context-{}", NEXT_THREAD.fetch_add(1, Ordering::Relaxed));
    let stop = CancellationToken::new();
    let (done_tx, termination) = Termination::channel();

    let registry = Arc::clone(factory.registry());
    let thread_stop = stop.clone();
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let reason = match std::panic::catch_unwind(AssertUnwindSafe(|| {
                host_on_thread(context_end, entry, registry, thread_stop)
            })) {
                Ok(reason) => reason,
                Err(payload) => {
                    format!("thread panicked: {}", Failure::from_panic(payload).message)
                }
            };
            let _ = done_tx.send(Some(reason));
        })
        .map_err(|e| ContextError::Start(format!("failed to spawn thread {name}: {e}")))?;

    tracing::debug!(thread = %name, "Context thread spawned");
    Ok(Launched {
        channel: Channel::new(parent_end),
        handle: Arc::new(ThreadHandle {
            name,
            stop,
            termination,
        }),
    })
}

fn host_on_thread(
    stream: DuplexStream,
    entry: TaskEnvelope,
    registry: Arc<TaskRegistry>,
    stop: CancellationToken,
) -> String {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => return format!("failed to build thread runtime: {e}"),
    };

    runtime.block_on(async move {
        let served = host::serve(Channel::new(stream), entry, registry, CancellationToken::new());
        tokio::select! {
            served = served => {
                match served {
                    Ok(result) if result.is_success() => "thread finished".to_string(),
                    Ok(_) => "thread finished with a failure".to_string(),
                    Err(e) => format!("thread lost its channel: {e}"),
                }
            }
            _ = stop.cancelled() => "thread stopped".to_string(),
        }
    })
}

#[derive(Debug)]
struct ThreadHandle {
    name: String,
    stop: CancellationToken,
    termination: Termination,
}

#[async_trait]
impl ContextHandle for ThreadHandle {
    fn describe(&self) -> String {
        format!("thread {}", self.name)
    }

    fn kill(&self) {
        self.stop.cancel();
    }

    fn is_alive(&self) -> bool {
        !self.termination.is_done()
    }

    async fn termination(&self) -> String {
        self.termination.wait().await
    }
}
