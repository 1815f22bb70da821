//! Process backend: spawn the worker binary and pair it through the hub.
//!
//! Flow:
//! 1. Register a fresh key with the hub
//! 2. Spawn the worker binary (stdin piped, stdout discarded, stderr inherited)
//! 3. Write the bootstrap record to the child's stdin
//! 4. Wait for the child to connect and present the key

use std::process::Stdio;

use async_trait::async_trait;
use futures::SinkExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use super::{ContextError, ContextFactory, ContextHandle, Launched};
use crate::bridge::Channel;
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Bootstrap, TaskEnvelope};
use crate::hub::HubError;

pub(super) async fn launch(
    factory: &ContextFactory,
    entry: TaskEnvelope,
) -> Result<Launched, ContextError> {
    let config = factory.config();
    let hub = factory.hub().await?;
    let key = hub.generate_key();
    let pending = hub.expect(key)?;

    let program = config.worker_program()?;
    let mut command = Command::new(&program);
    command
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());
    if let Some(cwd) = &config.cwd {
        command.current_dir(cwd);
    }
    if !config.env.is_empty() {
        command.env_clear().envs(config.env.iter().map(|(k, v)| (k, v)));
    }

    tracing::debug!(program = %program.display(), entry = %entry.name, "Spawning context process");
    let mut child = command.spawn().map_err(|e| {
        ContextError::Start(format!("failed to spawn {}: {e}", program.display()))
    })?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ContextError::Start("stdin not captured".to_string()))?;
    let handle = ProcessHandle::watch(child);

    let bootstrap = Bootstrap {
        uri: hub.uri().to_string(),
        key,
        connect_timeout_ms: u64::try_from(config.connect_timeout.as_millis()).unwrap_or(u64::MAX),
        entry,
    };
    let mut writer = FramedWrite::new(stdin, JsonCodec::<Bootstrap>::new());
    if let Err(e) = writer.send(bootstrap).await {
        handle.kill();
        return Err(ContextError::Start(format!("failed to send bootstrap: {e}")));
    }
    // Closing stdin tells the child nothing else is coming.
    drop(writer);

    let deadline = config.connect_timeout + config.hub.key_receive_timeout;
    let never = CancellationToken::new();
    let stream = tokio::select! {
        stream = pending.wait(&never) => stream,
        reason = handle.termination() => {
            return Err(ContextError::Start(format!(
                "context process exited before connecting ({reason})"
            )));
        }
        _ = tokio::time::sleep(deadline) => Err(HubError::ConnectTimeout),
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            handle.kill();
            return Err(e.into());
        }
    };

    tracing::debug!(pid = ?handle.pid, "Context process connected");
    Ok(Launched {
        channel: Channel::new(stream),
        handle: std::sync::Arc::new(handle),
    })
}

#[derive(Debug)]
struct ProcessHandle {
    pid: Option<u32>,
    kill: CancellationToken,
    status: watch::Receiver<Option<String>>,
}

impl ProcessHandle {
    /// Hand the child to a reaper task that reports its exit status.
    fn watch(mut child: Child) -> Self {
        let pid = child.id();
        let kill = CancellationToken::new();
        let (tx, rx) = watch::channel(None);

        let kill_requested = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_requested.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(error = %e, "Kill of context process failed");
                    }
                    child.wait().await
                }
            };
            let reason = match status {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {e}"),
            };
            tracing::debug!(?pid, %reason, "Context process exited");
            let _ = tx.send(Some(reason));
        });

        Self {
            pid,
            kill,
            status: rx,
        }
    }
}

#[async_trait]
impl ContextHandle for ProcessHandle {
    fn describe(&self) -> String {
        match self.pid {
            Some(pid) => format!("pid {pid}"),
            None => "exited process".to_string(),
        }
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn kill(&self) {
        self.kill.cancel();
    }

    fn is_alive(&self) -> bool {
        self.status.borrow().is_none()
    }

    async fn termination(&self) -> String {
        let mut rx = self.status.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "process reaper stopped".to_string(),
        }
    }

    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal) -> Result<(), ContextError> {
        use nix::unistd::Pid;

        let pid = match self.pid {
            Some(pid) if self.is_alive() => pid,
            _ => return Err(ContextError::Stopped),
        };
        let pid = i32::try_from(pid)
            .map_err(|_| ContextError::Signal(format!("pid {pid} out of range")))?;
        tracing::debug!(pid, %signal, "Signalling context process");
        nix::sys::signal::kill(Pid::from_raw(pid), signal)
            .map_err(|e| ContextError::Signal(format!("{signal} to pid {pid}: {e}")))
    }
}
