//! Context-side host: runs one entry task against a parent channel.
//!
//! The same host backs every context flavour. Process contexts reach it through
//! [`child_main`] (stdin bootstrap, hub connect); thread and runtime contexts call
//! [`serve`] directly over an in-memory stream.
//!
//! Frame flow:
//! - parent data frames → task inbound queue
//! - task outbound queue → parent data frames
//! - task completion → one exit frame, after every queued message

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Bootstrap, Frame, TaskEnvelope};
use crate::bridge::{Channel, ChannelError};
use crate::exit::{ExitResult, Failure};
use crate::hub::{self, HubError, HubUri};
use crate::task::{TaskChannel, TaskRegistry, UNRESOLVABLE_KIND};

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to read bootstrap record from stdin: {0}")]
    Bootstrap(String),
    #[error("failed to connect to hub: {0}")]
    Connect(#[from] HubError),
    #[error("failed to deliver exit result: {0}")]
    Channel(#[from] ChannelError),
    #[error("failed to isolate stdout: {0}")]
    Stdio(#[source] std::io::Error),
    #[error("entry task could not be located: {0}")]
    Unresolvable(String),
}

/// Run `entry` to completion and deliver its exit result over `channel`.
///
/// Returns the delivered result. Cancelling `cancel` asks the entry task to stop;
/// it still gets to report how it ended.
pub async fn serve(
    channel: Channel,
    entry: TaskEnvelope,
    registry: Arc<TaskRegistry>,
    cancel: CancellationToken,
) -> Result<ExitResult, ChannelError> {
    let channel = Arc::new(channel);
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let task_channel = TaskChannel::new(in_rx, out_tx);

    let entry_name = entry.name.clone();
    tracing::debug!(entry = %entry_name, "Hosting entry task");

    let reader_stop = CancellationToken::new();
    let reader = tokio::spawn(pump_inbound(Arc::clone(&channel), in_tx, reader_stop.clone()));
    let writer_done = CancellationToken::new();
    let writer = tokio::spawn(pump_outbound(Arc::clone(&channel), out_rx, writer_done.clone()));

    let task = {
        let registry = Arc::clone(&registry);
        let cancel = cancel.clone();
        tokio::spawn(async move { registry.run(entry, task_channel, cancel).await })
    };
    // If this future is dropped (runtime context killed), take the helpers down too.
    let _guard = AbortOnDrop(vec![
        reader.abort_handle(),
        writer.abort_handle(),
        task.abort_handle(),
    ]);

    let result = match task.await {
        Ok(Ok(value)) => ExitResult::success(value),
        Ok(Err(failure)) => ExitResult::failure(failure),
        Err(e) if e.is_panic() => ExitResult::failure(Failure::from_panic(e.into_panic())),
        Err(_) => ExitResult::failure(Failure::cancelled()),
    };
    tracing::debug!(entry = %entry_name, success = result.is_success(), "Entry task finished");

    writer_done.cancel();
    if let Err(e) = writer.await {
        tracing::warn!(error = %e, "Outbound pump failed");
    }
    reader_stop.cancel();
    let _ = reader.await;

    channel
        .send_frame(Frame::Exit {
            result: result.clone(),
        })
        .await?;
    if let Err(e) = channel.shutdown().await {
        tracing::debug!(error = %e, "Channel shutdown after exit frame failed");
    }
    Ok(result)
}

struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

async fn pump_inbound(
    channel: Arc<Channel>,
    tx: mpsc::UnboundedSender<serde_json::Value>,
    stop: CancellationToken,
) {
    loop {
        match channel.receive_frame(&stop).await {
            Ok(Frame::Data { value }) => {
                if tx.send(value).is_err() {
                    // Entry task dropped its channel; keep draining so the parent
                    // never blocks on a full socket.
                    tracing::trace!("Inbound message dropped: task channel gone");
                }
            }
            Ok(Frame::Exit { .. }) => {
                tracing::warn!("Ignoring exit frame sent by parent");
            }
            Err(ChannelError::Serialization(e)) => {
                tracing::warn!(error = %e, "Dropping undecodable frame from parent");
            }
            Err(ChannelError::Cancelled) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Parent channel closed");
                break;
            }
        }
    }
}

async fn pump_outbound(
    channel: Arc<Channel>,
    mut rx: mpsc::UnboundedReceiver<serde_json::Value>,
    done: CancellationToken,
) {
    let mut finishing = false;
    loop {
        let next = if finishing {
            rx.recv().await
        } else {
            tokio::select! {
                biased;
                value = rx.recv() => value,
                _ = done.cancelled() => {
                    // Senders may outlive the task; take what is queued and stop.
                    rx.close();
                    finishing = true;
                    continue;
                }
            }
        };
        let Some(value) = next else { break };

        if let Err(e) = channel.send_frame(Frame::data(value)).await {
            if e.is_fatal() {
                tracing::debug!(error = %e, "Parent channel closed while sending");
                break;
            }
            tracing::warn!(error = %e, "Dropping unsendable task message");
        }
    }
}

/// Entry point of a process context.
///
/// Reads the [`Bootstrap`] record from stdin, isolates stdout, connects back to the
/// hub, and serves the entry task. On `Err` the process should exit non-zero:
/// either the parent never got an exit result, or the entry task could not be
/// located (the parent still receives that failure before the error returns).
pub async fn child_main(registry: TaskRegistry) -> Result<ExitResult, HostError> {
    let bootstrap = read_bootstrap().await?;
    crate::fd_redirect::redirect_stdout_to_stderr().map_err(HostError::Stdio)?;

    let uri: HubUri = bootstrap
        .uri
        .parse()
        .map_err(|e: HubError| HostError::Bootstrap(e.to_string()))?;
    let timeout = Duration::from_millis(bootstrap.connect_timeout_ms);
    tracing::debug!(%uri, ?timeout, entry = %bootstrap.entry.name, "Connecting to hub");
    let stream = hub::connect(&uri, &bootstrap.key, timeout).await?;

    let cancel = CancellationToken::new();
    let result = serve(
        Channel::new(stream),
        bootstrap.entry,
        Arc::new(registry),
        cancel,
    )
    .await?;
    match result {
        ExitResult::Failure { failure } if failure.kind == UNRESOLVABLE_KIND => {
            Err(HostError::Unresolvable(failure.message))
        }
        result => Ok(result),
    }
}

async fn read_bootstrap() -> Result<Bootstrap, HostError> {
    let mut stdin = FramedRead::new(tokio::io::stdin(), JsonCodec::<Bootstrap>::new());
    match stdin.next().await {
        Some(Ok(Ok(bootstrap))) => Ok(bootstrap),
        Some(Ok(Err(e))) => Err(HostError::Bootstrap(e.to_string())),
        Some(Err(e)) => Err(HostError::Bootstrap(e.to_string())),
        None => Err(HostError::Bootstrap("stdin closed before bootstrap".to_string())),
    }
}
