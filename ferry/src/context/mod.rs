//! Execution contexts: one isolated unit (process, thread, or runtime task)
//! running an entry task, with a framed channel to talk to it.
//!
//! State machine:
//!
//! ```text
//! Unstarted ──start()──► Starting ──► Running ──┬─ join() ──► Joined
//!                                               ├─ kill() ──► Killed
//!                                               ├─ EOF ─────► Crashed
//!                                               └─ close() ─► Closed
//! ```
//!
//! All operations take `&self` so a context can be shared between a reader and
//! a writer (the worker pumps receives while submitters send). Reading must
//! still be done by one logical reader at a time.

mod factory;
mod process;
mod runtime;
mod thread;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use factory::{BackendKind, ContextConfig, ContextFactory};

use crate::bridge::protocol::{Frame, TaskEnvelope};
use crate::bridge::{Channel, ChannelError, SerializationError};
use crate::exit::{ExitResult, Failure};
use crate::hub::HubError;

/// How long a crashed context gets to report why before we stop asking.
const CRASH_REPORT_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Unstarted,
    Starting,
    Running,
    Joined,
    Killed,
    Crashed,
    Closed,
}

impl ContextState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Joined | Self::Killed | Self::Crashed | Self::Closed)
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Joined => "joined",
            Self::Killed => "killed",
            Self::Crashed => "crashed",
            Self::Closed => "closed",
        })
    }
}

/// Misuse of the context state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot {operation} a context that is {state}")]
pub struct StatusError {
    pub operation: &'static str,
    pub state: ContextState,
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("failed to start context: {0}")]
    Start(String),
    #[error("the context stopped responding")]
    Stopped,
    #[error("the context crashed ({reason})")]
    Crashed { reason: String },
    #[error("the context was killed")]
    Killed,
    /// The context delivered its exit result; collect it with `join`.
    #[error("the context exited")]
    Exited,
    /// The context exited with a failure.
    #[error("context failed: {0}")]
    Failed(Box<Failure>),
    #[error("wait cancelled")]
    Cancelled,
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("context channel failed: {0}")]
    Channel(#[source] ChannelError),
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error("failed to signal context: {0}")]
    Signal(String),
    #[error("{0} is not supported by this context")]
    Unsupported(&'static str),
}

impl From<ChannelError> for ContextError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Serialization(e) => Self::Serialization(e),
            ChannelError::Cancelled => Self::Cancelled,
            ChannelError::Closed | ChannelError::Disconnected => Self::Stopped,
            other => Self::Channel(other),
        }
    }
}

/// Backend-side view of a launched unit.
#[async_trait]
pub(crate) trait ContextHandle: Send + Sync + fmt::Debug {
    /// Short label for logs: `pid 4242`, `thread ferry-context-3`.
    fn describe(&self) -> String;

    fn pid(&self) -> Option<u32> {
        None
    }

    /// Begin forced termination. Must not block.
    fn kill(&self);

    fn is_alive(&self) -> bool;

    /// Wait until the unit has ended and describe how.
    async fn termination(&self) -> String;

    #[cfg(unix)]
    fn signal(&self, _signal: nix::sys::signal::Signal) -> Result<(), ContextError> {
        Err(ContextError::Unsupported("signal delivery"))
    }
}

pub(crate) struct Launched {
    pub channel: Channel,
    pub handle: Arc<dyn ContextHandle>,
}

/// Termination report shared by the thread and runtime backends.
#[derive(Debug, Clone)]
pub(crate) struct Termination(watch::Receiver<Option<String>>);

impl Termination {
    pub fn channel() -> (watch::Sender<Option<String>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self(rx))
    }

    pub fn is_done(&self) -> bool {
        self.0.borrow().is_some()
    }

    pub async fn wait(&self) -> String {
        let mut rx = self.0.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "ended without reporting".to_string(),
        }
    }
}

struct Inner {
    state: ContextState,
    channel: Option<Arc<Channel>>,
    handle: Option<Arc<dyn ContextHandle>>,
    exit: Option<ExitResult>,
    crash: Option<String>,
}

/// One isolated unit of execution and its channel.
///
/// Cloning yields a fresh, unstarted context with the same backend and entry
/// task, never a second handle to the same unit. Dropping a running context
/// kills it; call [`close`](Self::close) first to let it finish on its own.
pub struct ExecutionContext {
    factory: ContextFactory,
    entry: TaskEnvelope,
    inner: Mutex<Inner>,
}

impl ExecutionContext {
    pub(crate) fn new(factory: ContextFactory, entry: TaskEnvelope) -> Self {
        Self {
            factory,
            entry,
            inner: Mutex::new(Inner {
                state: ContextState::Unstarted,
                channel: None,
                handle: None,
                exit: None,
                crash: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Context state mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> ContextState {
        self.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ContextState::Running
    }

    pub fn backend(&self) -> BackendKind {
        self.factory.backend()
    }

    /// Name of the entry task.
    pub fn entry_name(&self) -> &str {
        &self.entry.name
    }

    /// Process id, for process contexts that have started.
    pub fn pid(&self) -> Option<u32> {
        self.lock().handle.as_ref().and_then(|h| h.pid())
    }

    /// Send a signal to a running process context.
    #[cfg(unix)]
    pub fn signal(&self, signal: nix::sys::signal::Signal) -> Result<(), ContextError> {
        let handle = {
            let inner = self.lock();
            if inner.state != ContextState::Running {
                return Err(StatusError {
                    operation: "signal",
                    state: inner.state,
                }
                .into());
            }
            inner.handle.clone()
        };
        match handle {
            Some(handle) => handle.signal(signal),
            None => Err(ContextError::Stopped),
        }
    }

    /// Launch the unit. Callable exactly once.
    pub async fn start(&self) -> Result<(), ContextError> {
        {
            let mut inner = self.lock();
            if inner.state != ContextState::Unstarted {
                return Err(StatusError {
                    operation: "start",
                    state: inner.state,
                }
                .into());
            }
            inner.state = ContextState::Starting;
        }

        let backend = self.factory.backend();
        tracing::debug!(%backend, entry = %self.entry.name, "Starting context");
        let launched = self.factory.launch(self.entry.clone()).await;

        let mut inner = self.lock();
        match launched {
            Ok(Launched { channel, handle }) => {
                if inner.state == ContextState::Killed {
                    handle.kill();
                    return Err(ContextError::Killed);
                }
                tracing::debug!(%backend, context = %handle.describe(), "Context running");
                inner.channel = Some(Arc::new(channel));
                inner.handle = Some(handle);
                inner.state = ContextState::Running;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%backend, error = %e, "Context failed to start");
                if inner.state == ContextState::Starting {
                    inner.state = ContextState::Crashed;
                    inner.crash = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    fn channel_for(&self, operation: &'static str) -> Result<Arc<Channel>, ContextError> {
        let inner = self.lock();
        match inner.state {
            ContextState::Unstarted | ContextState::Starting => Err(StatusError {
                operation,
                state: inner.state,
            }
            .into()),
            ContextState::Running => inner.channel.clone().ok_or(ContextError::Stopped),
            _ => Err(ContextError::Stopped),
        }
    }

    /// Send one value to the entry task.
    pub async fn send<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), ContextError> {
        let channel = self.channel_for("send to")?;
        channel.send(value).await.map_err(ContextError::from)
    }

    /// Receive one value from the entry task.
    ///
    /// Fails with [`ContextError::Exited`] once the exit result arrives; the
    /// result is kept for [`join`](Self::join).
    pub async fn receive<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
    ) -> Result<T, ContextError> {
        let channel = self.channel_for("receive from")?;
        match channel.receive_frame(cancel).await {
            Ok(Frame::Data { value }) => {
                Ok(serde_json::from_value(value).map_err(SerializationError::from)?)
            }
            Ok(Frame::Exit { result }) => {
                self.lock().exit = Some(result);
                Err(ContextError::Exited)
            }
            Err(ChannelError::Disconnected) => Err(self.crashed().await),
            Err(ChannelError::Closed) => Err(self.closed_error()),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for the entry task's return value.
    ///
    /// A failure exit surfaces as [`ContextError::Failed`]. Cancelling abandons
    /// the wait only; the context keeps running.
    pub async fn join(
        &self,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, ContextError> {
        self.join_exit(cancel).await?.get_result()
    }

    /// Wait for the raw exit result.
    pub async fn join_exit(&self, cancel: &CancellationToken) -> Result<ExitResult, ContextError> {
        let channel = {
            let mut inner = self.lock();
            match inner.state {
                ContextState::Unstarted | ContextState::Starting => {
                    return Err(StatusError {
                        operation: "join",
                        state: inner.state,
                    }
                    .into());
                }
                ContextState::Joined => return inner.exit.clone().ok_or(ContextError::Stopped),
                ContextState::Killed => return Err(ContextError::Killed),
                ContextState::Crashed => {
                    return Err(ContextError::Crashed {
                        reason: inner.crash.clone().unwrap_or_default(),
                    });
                }
                ContextState::Closed => return Err(ContextError::Stopped),
                ContextState::Running => {}
            }
            if let Some(exit) = inner.exit.take() {
                return Ok(Self::finish_join(&mut inner, exit));
            }
            inner.channel.clone().ok_or(ContextError::Stopped)?
        };

        loop {
            match channel.receive_frame(cancel).await {
                Ok(Frame::Exit { result }) => {
                    let mut inner = self.lock();
                    return Ok(Self::finish_join(&mut inner, result));
                }
                Ok(Frame::Data { .. }) => {
                    tracing::debug!("Discarding unread data frame while joining");
                }
                Err(ChannelError::Serialization(e)) => {
                    tracing::warn!(error = %e, "Discarding undecodable frame while joining");
                }
                Err(ChannelError::Disconnected) => return Err(self.crashed().await),
                Err(ChannelError::Closed) => return Err(self.closed_error()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn finish_join(inner: &mut Inner, result: ExitResult) -> ExitResult {
        inner.state = ContextState::Joined;
        inner.exit = Some(result.clone());
        if let Some(channel) = inner.channel.take() {
            channel.close();
        }
        tracing::debug!(success = result.is_success(), "Context joined");
        result
    }

    async fn crashed(&self) -> ContextError {
        let handle = self.lock().handle.clone();
        let reason = match handle {
            Some(handle) => tokio::time::timeout(CRASH_REPORT_WAIT, handle.termination())
                .await
                .unwrap_or_else(|_| "closed its channel without an exit result".to_string()),
            None => "closed its channel without an exit result".to_string(),
        };

        let mut inner = self.lock();
        match inner.state {
            ContextState::Running => {
                tracing::warn!(reason = %reason, "Context crashed");
                inner.state = ContextState::Crashed;
                inner.crash = Some(reason.clone());
                if let Some(channel) = inner.channel.take() {
                    channel.close();
                }
                ContextError::Crashed { reason }
            }
            ContextState::Killed => ContextError::Killed,
            ContextState::Crashed => ContextError::Crashed {
                reason: inner.crash.clone().unwrap_or(reason),
            },
            _ => ContextError::Stopped,
        }
    }

    fn closed_error(&self) -> ContextError {
        match self.state() {
            ContextState::Killed => ContextError::Killed,
            _ => ContextError::Stopped,
        }
    }

    /// Forcibly terminate the unit. Idempotent, never blocks.
    pub fn kill(&self) {
        let mut inner = self.lock();
        match inner.state {
            ContextState::Starting => inner.state = ContextState::Killed,
            ContextState::Running | ContextState::Closed => {
                if let Some(handle) = &inner.handle {
                    tracing::debug!(context = %handle.describe(), "Killing context");
                    handle.kill();
                }
                if let Some(channel) = inner.channel.take() {
                    channel.close();
                }
                inner.state = ContextState::Killed;
            }
            _ => {}
        }
    }

    /// Drop our end of the channel without killing the unit.
    pub fn close(&self) {
        let mut inner = self.lock();
        if let Some(channel) = inner.channel.take() {
            channel.close();
        }
        if inner.state == ContextState::Running {
            inner.state = ContextState::Closed;
        }
    }

    /// Wait for the underlying unit to end and describe how, e.g. the exit
    /// status of a process. `None` if the context was never launched.
    pub async fn termination(&self) -> Option<String> {
        let handle = self.lock().handle.clone()?;
        Some(handle.termination().await)
    }

    /// Whether the underlying process/thread/task is still alive.
    pub fn is_alive(&self) -> bool {
        self.lock().handle.as_ref().is_some_and(|h| h.is_alive())
    }
}

impl Clone for ExecutionContext {
    fn clone(&self) -> Self {
        Self::new(self.factory.clone(), self.entry.clone())
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        let inner = self.lock();
        if matches!(inner.state, ContextState::Running | ContextState::Starting)
            && let Some(handle) = &inner.handle
        {
            tracing::debug!(context = %handle.describe(), "Killing context dropped while running");
            handle.kill();
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ExecutionContext")
            .field("backend", &self.factory.backend())
            .field("entry", &self.entry.name)
            .field("state", &inner.state)
            .field("handle", &inner.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::diagnostic::{Echo, Fail, Relay, Sleep};
    use std::time::Instant;

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    fn factories() -> Vec<ContextFactory> {
        vec![ContextFactory::thread(), ContextFactory::runtime()]
    }

    #[tokio::test]
    async fn join_returns_entry_value() {
        for factory in factories() {
            for value in [
                serde_json::json!(42),
                serde_json::json!("text"),
                serde_json::json!({"nested": [1, {"deep": null}]}),
                serde_json::Value::Null,
            ] {
                let context = factory.create(&Echo::new(value.clone())).unwrap();
                context.start().await.unwrap();
                assert_eq!(context.join(&never()).await.unwrap(), value);
                assert_eq!(context.state(), ContextState::Joined);
            }
        }
    }

    #[tokio::test]
    async fn failure_message_survives_join() {
        for factory in factories() {
            let context = factory.create(&Fail::new("Test message")).unwrap();
            context.start().await.unwrap();
            let err = context.join(&never()).await.unwrap_err();
            assert!(matches!(err, ContextError::Failed(_)));
            assert!(err.to_string().contains("Test message"), "{err}");
        }
    }

    #[tokio::test]
    async fn start_twice_is_status_error() {
        let context = ContextFactory::runtime().create(&Echo::new(1)).unwrap();
        context.start().await.unwrap();
        let err = context.start().await.unwrap_err();
        assert!(matches!(
            err,
            ContextError::Status(StatusError { operation: "start", state: ContextState::Running })
        ));
    }

    #[tokio::test]
    async fn operations_before_start_are_status_errors() {
        let context = ContextFactory::runtime().create(&Echo::new(1)).unwrap();
        assert!(matches!(context.join(&never()).await, Err(ContextError::Status(_))));
        assert!(matches!(context.send(&1).await, Err(ContextError::Status(_))));
        assert!(matches!(context.receive::<i32>(&never()).await, Err(ContextError::Status(_))));
    }

    #[tokio::test]
    async fn channel_after_exit_reports_stopped() {
        let context = ContextFactory::thread().create(&Echo::new(1)).unwrap();
        context.start().await.unwrap();
        context.join(&never()).await.unwrap();

        let err = context.send(&"late").await.unwrap_err();
        assert!(err.to_string().contains("stopped responding"));
        let err = context.receive::<String>(&never()).await.unwrap_err();
        assert!(matches!(err, ContextError::Stopped));
    }

    #[tokio::test]
    async fn kill_is_prompt_and_idempotent() {
        for factory in factories() {
            let context = factory.create(&Sleep::new(Duration::from_secs(30))).unwrap();
            context.start().await.unwrap();

            let started = Instant::now();
            context.kill();
            assert!(started.elapsed() < Duration::from_millis(200));
            assert!(!context.is_running());
            context.kill();
            assert_eq!(context.state(), ContextState::Killed);
            assert!(matches!(context.join(&never()).await, Err(ContextError::Killed)));
        }
    }

    #[tokio::test]
    async fn kill_before_start_is_noop() {
        let context = ContextFactory::runtime().create(&Echo::new(1)).unwrap();
        context.kill();
        assert_eq!(context.state(), ContextState::Unstarted);
        context.start().await.unwrap();
        assert_eq!(context.join(&never()).await.unwrap(), serde_json::json!(1));
    }

    #[tokio::test]
    async fn cancelled_join_leaves_context_running() {
        let context = ContextFactory::thread()
            .create(&Sleep::new(Duration::from_millis(150)))
            .unwrap();
        context.start().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(context.join(&cancel).await, Err(ContextError::Cancelled)));
        assert!(context.is_running());

        assert_eq!(context.join(&never()).await.unwrap(), serde_json::json!(150));
    }

    #[tokio::test]
    async fn bidirectional_messages() {
        for factory in factories() {
            let context = factory.create(&Relay { limit: Some(2) }).unwrap();
            context.start().await.unwrap();

            context.send(&"one").await.unwrap();
            assert_eq!(context.receive::<String>(&never()).await.unwrap(), "one");
            context.send(&2).await.unwrap();
            assert_eq!(context.receive::<i32>(&never()).await.unwrap(), 2);

            assert!(matches!(context.receive::<i32>(&never()).await, Err(ContextError::Exited)));
            assert_eq!(context.join(&never()).await.unwrap(), serde_json::json!(2));
        }
    }

    #[tokio::test]
    async fn clone_is_fresh_and_unstarted() {
        let context = ContextFactory::runtime().create(&Echo::new("a")).unwrap();
        context.start().await.unwrap();
        let copy = context.clone();
        assert_eq!(copy.state(), ContextState::Unstarted);
        copy.start().await.unwrap();
        assert_eq!(copy.join(&never()).await.unwrap(), serde_json::json!("a"));
        assert_eq!(context.join(&never()).await.unwrap(), serde_json::json!("a"));
    }

    #[tokio::test]
    async fn close_lets_context_finish() {
        let context = ContextFactory::thread().create(&Relay::default()).unwrap();
        context.start().await.unwrap();
        context.close();
        assert_eq!(context.state(), ContextState::Closed);
        assert!(matches!(context.send(&1).await, Err(ContextError::Stopped)));

        // The relay sees its parent hang up and returns on its own.
        let deadline = Instant::now() + Duration::from_secs(5);
        while context.is_alive() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!context.is_alive());
    }

    #[tokio::test]
    async fn unserializable_send_keeps_context_usable() {
        struct Handle;
        impl Serialize for Handle {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("live handle"))
            }
        }

        let context = ContextFactory::runtime().create(&Relay { limit: Some(1) }).unwrap();
        context.start().await.unwrap();
        assert!(matches!(context.send(&Handle).await, Err(ContextError::Serialization(_))));
        context.send(&"ok").await.unwrap();
        assert_eq!(context.receive::<String>(&never()).await.unwrap(), "ok");
    }
}
