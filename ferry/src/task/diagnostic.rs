//! Built-in diagnostic tasks for smoke tests, warm-up and health checks.
//!
//! Registered by [`TaskRegistry::with_diagnostics`](super::TaskRegistry::with_diagnostics)
//! and by the `ferry-worker` binary.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Task, TaskChannel, TaskRegistry};
use crate::bridge::ChannelError;
use crate::exit::Failure;

pub const FAIL_KIND: &str = "ferry::diagnostic::Fail";

pub(crate) fn register(registry: &mut TaskRegistry) {
    registry
        .register::<Echo>()
        .register::<Sleep>()
        .register::<Fail>()
        .register::<Relay>()
        .register::<Identify>()
        .register::<Panic>()
        .register::<Abort>();
}

/// Returns its value unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    pub value: serde_json::Value,
}

impl Echo {
    pub fn new(value: impl Into<serde_json::Value>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[async_trait]
impl Task for Echo {
    const NAME: &'static str = "ferry.echo";
    type Output = serde_json::Value;

    async fn run(self, _: TaskChannel, _: CancellationToken) -> Result<Self::Output, Failure> {
        Ok(self.value)
    }
}

/// Sleeps, honouring cancellation. Returns the requested milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sleep {
    pub millis: u64,
}

impl Sleep {
    pub fn new(duration: Duration) -> Self {
        Self {
            millis: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[async_trait]
impl Task for Sleep {
    const NAME: &'static str = "ferry.sleep";
    type Output = u64;

    async fn run(self, _: TaskChannel, cancel: CancellationToken) -> Result<u64, Failure> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Failure::cancelled()),
            _ = tokio::time::sleep(Duration::from_millis(self.millis)) => Ok(self.millis),
        }
    }
}

/// Always fails with the given message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fail {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Fail {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }
}

#[async_trait]
impl Task for Fail {
    const NAME: &'static str = "ferry.fail";
    type Output = ();

    async fn run(self, _: TaskChannel, _: CancellationToken) -> Result<(), Failure> {
        let failure = Failure::new(FAIL_KIND, self.message);
        Err(match self.code {
            Some(code) => failure.with_code(code),
            None => failure,
        })
    }
}

/// Sends every received message straight back. Stops after `limit` messages
/// (if set), when the submitter side closes, or on cancellation. Returns the
/// number of messages relayed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Relay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[async_trait]
impl Task for Relay {
    const NAME: &'static str = "ferry.relay";
    type Output = usize;

    async fn run(
        self,
        mut channel: TaskChannel,
        cancel: CancellationToken,
    ) -> Result<usize, Failure> {
        let mut relayed = 0;
        while self.limit.is_none_or(|limit| relayed < limit) {
            match channel.receive::<serde_json::Value>(&cancel).await {
                Ok(value) => {
                    channel.send(&value).map_err(|e| Failure::from_error(&e))?;
                    relayed += 1;
                }
                Err(ChannelError::Cancelled) => return Err(Failure::cancelled()),
                Err(ChannelError::Disconnected) => break,
                Err(e) => return Err(Failure::from_error(&e)),
            }
        }
        Ok(relayed)
    }
}

/// Where a task actually ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub pid: u32,
    pub thread: String,
}

/// Reports the process id and thread of the context running it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identify {
    /// Hold the context busy for this long before answering.
    #[serde(default)]
    pub hold_millis: u64,
}

#[async_trait]
impl Task for Identify {
    const NAME: &'static str = "ferry.identify";
    type Output = Identity;

    async fn run(self, _: TaskChannel, cancel: CancellationToken) -> Result<Identity, Failure> {
        if self.hold_millis > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Failure::cancelled()),
                _ = tokio::time::sleep(Duration::from_millis(self.hold_millis)) => {}
            }
        }
        let thread = std::thread::current();
        Ok(Identity {
            pid: std::process::id(),
            thread: thread
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", thread.id())),
        })
    }
}

/// Panics with the given message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Panic {
    pub message: String,
}

#[async_trait]
impl Task for Panic {
    const NAME: &'static str = "ferry.panic";
    type Output = ();

    async fn run(self, _: TaskChannel, _: CancellationToken) -> Result<(), Failure> {
        panic!("{}", self.message);
    }
}

/// Aborts the hosting process without producing a result.
///
/// Only meaningful in process contexts: in a thread or runtime context it takes
/// the parent down with it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Abort {}

#[async_trait]
impl Task for Abort {
    const NAME: &'static str = "ferry.abort";
    type Output = ();

    async fn run(self, _: TaskChannel, _: CancellationToken) -> Result<(), Failure> {
        tracing::warn!("Aborting context process on request");
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn echo_returns_value() {
        let (channel, _peer) = TaskChannel::pair();
        let out = Echo::new(vec![1, 2, 3])
            .run(channel, never())
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn sleep_observes_cancellation() {
        let (channel, _peer) = TaskChannel::pair();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Sleep::new(Duration::from_secs(30))
            .run(channel, cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn fail_carries_message_and_code() {
        let (channel, _peer) = TaskChannel::pair();
        let mut task = Fail::new("Test message");
        task.code = Some("E1".to_string());
        let err = task.run(channel, never()).await.unwrap_err();
        assert_eq!(err.kind, FAIL_KIND);
        assert_eq!(err.message, "Test message");
        assert_eq!(err.code.as_deref(), Some("E1"));
    }

    #[tokio::test]
    async fn relay_echoes_until_limit() {
        let (channel, mut peer) = TaskChannel::pair();
        peer.send(&"a").unwrap();
        peer.send(&"b").unwrap();

        let relayed = Relay { limit: Some(2) }
            .run(channel, never())
            .await
            .unwrap();
        assert_eq!(relayed, 2);
        assert_eq!(peer.receive::<String>(&never()).await.unwrap(), "a");
        assert_eq!(peer.receive::<String>(&never()).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn relay_stops_when_submitter_hangs_up() {
        let (channel, peer) = TaskChannel::pair();
        peer.send(&1).unwrap();
        drop(peer);
        let relayed = Relay::default().run(channel, never()).await.unwrap();
        assert_eq!(relayed, 1);
    }

    #[tokio::test]
    async fn identify_reports_this_process() {
        let (channel, _peer) = TaskChannel::pair();
        let id = Identify::default().run(channel, never()).await.unwrap();
        assert_eq!(id.pid, std::process::id());
    }
}
