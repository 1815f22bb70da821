//! Wire protocol types for parent-context communication.
//!
//! Two layers share one framed channel:
//! - **Context frames** (`Frame`): application data in either direction, plus the
//!   single terminal `Exit` frame a context sends just before it ends.
//! - **Job packets** (`JobPacket`): what a worker and the task runner exchange,
//!   carried as the value of `Frame::Data`. Job ids multiplex several logical
//!   task channels over the one physical channel.
//!
//! A spawned process additionally receives one `Bootstrap` record on stdin.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::exit::{ExitResult, Failure};
use crate::hub::HubKey;

/// Frame on a context channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Data { value: serde_json::Value },
    /// Terminal result; nothing follows it on the channel.
    Exit { result: ExitResult },
}

impl Frame {
    pub fn data(value: serde_json::Value) -> Self {
        Self::Data { value }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit { .. })
    }
}

/// Identifier of one job on one worker.
///
/// Assigned monotonically by the worker for the lifetime of its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serialized task: registry name plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub name: String,
    pub payload: serde_json::Value,
}

/// Messages between a worker (parent) and the task runner (inside the context).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPacket {
    /// Parent → runner: run `task` under `job_id`.
    Submit { job_id: JobId, task: TaskEnvelope },

    /// Either direction: in-task message for a running job.
    Message {
        job_id: JobId,
        data: serde_json::Value,
    },

    /// Parent → runner: cancel a queued or running job.
    Cancel { job_id: JobId },

    /// Runner → parent: terminal outcome of a job.
    Result { job_id: JobId, outcome: TaskOutcome },

    /// Parent → runner: finish and exit the runner loop.
    Shutdown,
}

impl JobPacket {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Submit { job_id, .. }
            | Self::Message { job_id, .. }
            | Self::Cancel { job_id }
            | Self::Result { job_id, .. } => Some(*job_id),
            Self::Shutdown => None,
        }
    }
}

/// How a job ended inside the context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { value: serde_json::Value },
    Failure { failure: Failure },
    /// The task observed cancellation. `failure` describes where it stopped.
    Cancelled { failure: Failure },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Startup record written to a spawned process's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bootstrap {
    /// Hub endpoint, see [`crate::hub::HubUri`].
    pub uri: String,
    pub key: HubKey,
    pub connect_timeout_ms: u64,
    pub entry: TaskEnvelope,
}
