//! Context construction: backend choice, spawn configuration, task registry,
//! and the lazily bound hub shared by every process context it creates.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;

use super::{ContextError, ExecutionContext, Launched};
use crate::bridge::SerializationError;
use crate::bridge::protocol::TaskEnvelope;
use crate::config::env_duration_ms;
use crate::hub::{Hub, HubConfig, HubError};
use crate::task::{Task, TaskRegistry, envelope};

const WORKER_BIN_NAME: &str = "ferry-worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// A child process connected through the hub.
    Process,
    /// A dedicated OS thread with its own single-threaded runtime.
    Thread,
    /// A task on the caller's tokio runtime.
    Runtime,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Process => "process",
            Self::Thread => "thread",
            Self::Runtime => "runtime",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(Self::Process),
            "thread" => Ok(Self::Thread),
            "runtime" => Ok(Self::Runtime),
            other => Err(format!("unknown context backend: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Child executable for process contexts. `None` resolves
    /// `FERRY_WORKER_BIN`, then `ferry-worker` beside the current executable,
    /// then the current executable itself.
    pub worker_bin: Option<PathBuf>,
    pub args: Vec<String>,
    /// Working directory for process contexts; `None` inherits ours.
    pub cwd: Option<PathBuf>,
    /// Complete environment for process contexts. Empty inherits ours.
    pub env: Vec<(String, String)>,
    /// How long a child has to connect back to the hub.
    pub connect_timeout: Duration,
    pub hub: HubConfig,
    /// In-memory buffer per direction for thread and runtime contexts.
    pub buffer_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            worker_bin: None,
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            connect_timeout: Duration::from_secs(5),
            hub: HubConfig::default(),
            buffer_size: 256 * 1024,
        }
    }
}

impl ContextConfig {
    pub fn from_env() -> Self {
        let mut config = Self {
            worker_bin: std::env::var_os("FERRY_WORKER_BIN").map(PathBuf::from),
            hub: HubConfig::from_env(),
            ..Self::default()
        };
        if let Some(timeout) = env_duration_ms("FERRY_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = timeout;
        }
        config
    }

    pub fn with_worker_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_bin = Some(path.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_hub(mut self, hub: HubConfig) -> Self {
        self.hub = hub;
        self
    }

    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    pub(crate) fn worker_program(&self) -> Result<PathBuf, ContextError> {
        if let Some(path) = &self.worker_bin {
            return Ok(path.clone());
        }
        if let Some(path) = std::env::var_os("FERRY_WORKER_BIN") {
            return Ok(PathBuf::from(path));
        }
        let current = std::env::current_exe()
            .map_err(|e| ContextError::Start(format!("cannot locate current executable: {e}")))?;
        if let Some(dir) = current.parent() {
            let sibling = dir.join(WORKER_BIN_NAME);
            if sibling.is_file() {
                return Ok(sibling);
            }
            // Test binaries live one level below the build directory.
            if let Some(parent) = dir.parent() {
                let sibling = parent.join(WORKER_BIN_NAME);
                if sibling.is_file() {
                    return Ok(sibling);
                }
            }
        }
        Ok(current)
    }
}

/// Creates [`ExecutionContext`]s for one backend.
///
/// Cheap to clone; clones share the registry and the hub.
#[derive(Clone)]
pub struct ContextFactory {
    backend: BackendKind,
    config: Arc<ContextConfig>,
    registry: Arc<TaskRegistry>,
    hub: Arc<OnceCell<Arc<Hub>>>,
}

impl ContextFactory {
    /// Factory with configuration from the environment and the diagnostic tasks
    /// registered.
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            config: Arc::new(ContextConfig::from_env()),
            registry: Arc::new(TaskRegistry::with_diagnostics()),
            hub: Arc::new(OnceCell::new()),
        }
    }

    pub fn process() -> Self {
        Self::new(BackendKind::Process)
    }

    pub fn thread() -> Self {
        Self::new(BackendKind::Thread)
    }

    pub fn runtime() -> Self {
        Self::new(BackendKind::Runtime)
    }

    pub fn with_config(mut self, config: ContextConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Tasks available to thread and runtime contexts. Process contexts resolve
    /// tasks with the registry compiled into their worker binary.
    pub fn with_registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Share an existing hub instead of binding one on first use.
    pub fn with_hub(mut self, hub: Arc<Hub>) -> Self {
        self.hub = Arc::new(OnceCell::new_with(Some(hub)));
        self
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// The hub, bound on first call.
    pub async fn hub(&self) -> Result<Arc<Hub>, HubError> {
        self.hub
            .get_or_try_init(|| async {
                tracing::debug!("Binding context hub");
                Hub::bind(self.config.hub.clone()).await
            })
            .await
            .cloned()
    }

    /// Unstarted context whose entry is `task`.
    pub fn create<T: Task>(&self, task: &T) -> Result<ExecutionContext, SerializationError> {
        Ok(self.create_envelope(envelope(task)?))
    }

    pub fn create_envelope(&self, entry: TaskEnvelope) -> ExecutionContext {
        ExecutionContext::new(self.clone(), entry)
    }

    pub(crate) async fn launch(&self, entry: TaskEnvelope) -> Result<Launched, ContextError> {
        match self.backend {
            BackendKind::Process => super::process::launch(self, entry).await,
            BackendKind::Thread => super::thread::launch(self, entry),
            BackendKind::Runtime => super::runtime::launch(self, entry),
        }
    }
}

impl fmt::Debug for ContextFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextFactory")
            .field("backend", &self.backend)
            .field("hub", &self.hub.get().map(|h| h.uri().to_string()))
            .finish_non_exhaustive()
    }
}
