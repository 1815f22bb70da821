//! Worker: one long-lived context running the task runner, fed job packets.
//!
//! Architecture:
//! - Submissions write `Submit` packets straight to the context channel
//! - A single pump task is the only reader; it routes `Message` packets to
//!   per-job queues and resolves each job on its `Result` packet
//! - A broken context fails every pending and future job with the same cause
//!
//! The context runs jobs one at a time; extra submissions queue inside it.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::bridge::SerializationError;
use crate::bridge::protocol::{JobId, JobPacket, TaskOutcome};
use crate::config::env_duration_ms;
use crate::context::{ContextError, ContextFactory, ExecutionContext};
use crate::exit::Failure;
use crate::runner::TaskRunner;
use crate::task::{Task, envelope};

static NEXT_WORKER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Grace period for the context to exit after a shutdown request.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(timeout) = env_duration_ms("FERRY_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout = timeout;
        }
        config
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker-level failure. Cloneable so one cause can fail many jobs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to start worker: {0}")]
    Start(String),
    #[error("the worker failed: {0}")]
    Failed(String),
    #[error("the worker exited unexpectedly: {0}")]
    Exited(String),
    #[error("the worker was killed")]
    Killed,
    #[error("the worker is shutting down")]
    ShuttingDown,
    #[error("worker shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Why a submitted job did not produce its output.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The task itself failed.
    #[error("task failed: {0}")]
    Task(Failure),
    #[error("task cancelled: {0}")]
    Cancelled(Failure),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    /// No more in-task messages: the job has finished.
    #[error("the job has finished")]
    Finished,
    #[error("receive cancelled")]
    ReceiveCancelled,
}

impl ExecutionError {
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Task(f) | Self::Cancelled(f) => Some(f),
            _ => None,
        }
    }
}

type JobResult = Result<TaskOutcome, WorkerError>;

struct PendingJob {
    result: oneshot::Sender<JobResult>,
    messages: mpsc::UnboundedSender<serde_json::Value>,
    finished: CancellationToken,
}

impl PendingJob {
    fn resolve(self, result: JobResult) {
        self.finished.cancel();
        let _ = self.result.send(result);
    }
}

struct Jobs {
    pending: HashMap<JobId, PendingJob>,
    failure: Option<WorkerError>,
    accepting: bool,
}

struct Shared {
    id: u64,
    jobs: Mutex<Jobs>,
    idle: Notify,
    next_job: AtomicU64,
    pump_stop: CancellationToken,
    pump_done: CancellationToken,
}

impl Shared {
    fn jobs(&self) -> MutexGuard<'_, Jobs> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            tracing::error!(worker = self.id, "Worker job table poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Put the worker in its permanent failed state and fail every pending job.
    fn fail_all(&self, error: WorkerError) {
        let mut jobs = self.jobs();
        let error = jobs.failure.get_or_insert(error).clone();
        jobs.accepting = false;
        let pending: Vec<_> = jobs.pending.drain().collect();
        drop(jobs);

        for (job_id, job) in pending {
            tracing::warn!(worker = self.id, %job_id, error = %error, "Failing job");
            job.resolve(Err(error.clone()));
        }
        self.idle.notify_waiters();
    }

    /// Drop a job that never reached the context.
    fn abandon(&self, job_id: JobId) {
        let mut jobs = self.jobs();
        if jobs.pending.remove(&job_id).is_some() && jobs.pending.is_empty() {
            drop(jobs);
            self.idle.notify_waiters();
        }
    }
}

/// Sends on the context on behalf of a worker or one of its executions.
#[derive(Clone)]
struct Link {
    context: Arc<ExecutionContext>,
    shared: Arc<Shared>,
}

impl Link {
    async fn send(&self, packet: &JobPacket) -> Result<(), ExecutionError> {
        match self.context.send(packet).await {
            Ok(()) => Ok(()),
            Err(ContextError::Serialization(e)) => Err(e.into()),
            Err(e) => {
                let error = WorkerError::Failed(e.to_string());
                self.shared.fail_all(error.clone());
                Err(error.into())
            }
        }
    }
}

pub struct Worker {
    link: Link,
    config: WorkerConfig,
}

impl Worker {
    /// Start a context running the task runner and begin pumping its channel.
    pub async fn start(
        factory: &ContextFactory,
        config: WorkerConfig,
    ) -> Result<Self, WorkerError> {
        let context = Arc::new(factory.create_envelope(TaskRunner::envelope()));
        context
            .start()
            .await
            .map_err(|e| WorkerError::Start(e.to_string()))?;

        let shared = Arc::new(Shared {
            id: NEXT_WORKER.fetch_add(1, Ordering::Relaxed),
            jobs: Mutex::new(Jobs {
                pending: HashMap::new(),
                failure: None,
                accepting: true,
            }),
            idle: Notify::new(),
            next_job: AtomicU64::new(1),
            pump_stop: CancellationToken::new(),
            pump_done: CancellationToken::new(),
        });
        tracing::debug!(
            worker = shared.id,
            backend = %factory.backend(),
            pid = ?context.pid(),
            "Worker started"
        );

        tokio::spawn(run_pump(Arc::clone(&context), Arc::clone(&shared)));
        Ok(Self {
            link: Link { context, shared },
            config,
        })
    }

    pub fn id(&self) -> u64 {
        self.link.shared.id
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.link.context
    }

    /// Accepting work on a healthy context.
    pub fn is_running(&self) -> bool {
        let jobs = self.link.shared.jobs();
        jobs.accepting && jobs.failure.is_none() && self.link.context.is_running()
    }

    /// No pending jobs.
    pub fn is_idle(&self) -> bool {
        self.link.shared.jobs().pending.is_empty()
    }

    pub fn pending_jobs(&self) -> usize {
        self.link.shared.jobs().pending.len()
    }

    /// The permanent failure, if the worker has one.
    pub fn failure(&self) -> Option<WorkerError> {
        self.link.shared.jobs().failure.clone()
    }

    /// Resolves once no jobs are pending.
    pub async fn until_idle(&self) {
        loop {
            let notified = self.link.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Submit a task. The returned handle yields its result and carries its
    /// in-task messages. Cancelling `cancel` asks the context to cancel the job.
    pub async fn submit<T: Task>(
        &self,
        task: &T,
        cancel: CancellationToken,
    ) -> Result<Execution<T>, ExecutionError> {
        let task = envelope(task)?;
        let shared = &self.link.shared;
        let job_id = JobId(shared.next_job.fetch_add(1, Ordering::Relaxed));
        let (result_tx, result_rx) = oneshot::channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let finished = CancellationToken::new();

        {
            let mut jobs = shared.jobs();
            if let Some(failure) = &jobs.failure {
                return Err(failure.clone().into());
            }
            if !jobs.accepting {
                return Err(WorkerError::ShuttingDown.into());
            }
            jobs.pending.insert(
                job_id,
                PendingJob {
                    result: result_tx,
                    messages: message_tx,
                    finished: finished.clone(),
                },
            );
        }

        tracing::debug!(worker = shared.id, %job_id, task = %task.name, "Submitting job");
        if let Err(e) = self.link.send(&JobPacket::Submit { job_id, task }).await {
            shared.abandon(job_id);
            return Err(e);
        }

        let link = self.link.clone();
        let watch_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = finished.cancelled() => {}
                _ = watch_cancel.cancelled() => {
                    tracing::trace!(worker = link.shared.id, %job_id, "Cancel requested");
                    if let Err(e) = link.send(&JobPacket::Cancel { job_id }).await {
                        tracing::debug!(%job_id, error = %e, "Failed to send cancel");
                    }
                }
            }
        });

        Ok(Execution {
            job_id,
            link: self.link.clone(),
            result: result_rx,
            messages: message_rx,
            cancel,
            _task: PhantomData,
        })
    }

    /// Stop accepting work, wait for pending jobs, then stop the context.
    ///
    /// The context gets `shutdown_timeout` to exit; after that it is killed and
    /// [`WorkerError::ShutdownTimeout`] is returned.
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        let shared = &self.link.shared;
        shared.jobs().accepting = false;
        tracing::debug!(worker = shared.id, pending = self.pending_jobs(), "Worker shutting down");
        self.until_idle().await;

        if let Some(failure) = self.failure() {
            self.link.context.kill();
            shared.pump_stop.cancel();
            return match failure {
                WorkerError::Killed => Ok(()),
                other => Err(other),
            };
        }

        if let Err(e) = self.link.send(&JobPacket::Shutdown).await {
            self.link.context.kill();
            return Err(match e {
                ExecutionError::Worker(w) => w,
                other => WorkerError::Failed(other.to_string()),
            });
        }

        let timeout = self.config.shutdown_timeout;
        let joined = tokio::time::timeout(timeout, async {
            shared.pump_done.cancelled().await;
            self.link.context.join_exit(&CancellationToken::new()).await
        })
        .await;

        match joined {
            Ok(Ok(exit)) if exit.is_success() => {
                tracing::debug!(worker = shared.id, "Worker stopped");
                Ok(())
            }
            Ok(Ok(exit)) => Err(WorkerError::Exited(match exit.get_result() {
                Err(e) => e.to_string(),
                Ok(_) => "unknown".to_string(),
            })),
            Ok(Err(e)) => Err(WorkerError::Exited(e.to_string())),
            Err(_) => {
                tracing::warn!(worker = shared.id, ?timeout, "Worker shutdown timed out, killing");
                self.link.context.kill();
                shared.pump_stop.cancel();
                Err(WorkerError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Kill the context now and fail pending jobs.
    pub fn kill(&self) {
        tracing::debug!(worker = self.id(), "Killing worker");
        self.link.shared.fail_all(WorkerError::Killed);
        self.link.context.kill();
        self.link.shared.pump_stop.cancel();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // The pump holds the context; it must let go for the context to die.
        self.link.shared.pump_stop.cancel();
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id())
            .field("pending", &self.pending_jobs())
            .field("context", &self.link.context)
            .finish()
    }
}

async fn run_pump(context: Arc<ExecutionContext>, shared: Arc<Shared>) {
    let stop = shared.pump_stop.clone();
    loop {
        match context.receive::<JobPacket>(&stop).await {
            Ok(JobPacket::Message { job_id, data }) => {
                let jobs = shared.jobs();
                match jobs.pending.get(&job_id) {
                    Some(job) => {
                        let _ = job.messages.send(data);
                    }
                    None => {
                        tracing::debug!(
                            worker = shared.id,
                            %job_id,
                            "Message for unknown job dropped"
                        );
                    }
                }
            }
            Ok(JobPacket::Result { job_id, outcome }) => {
                let (job, now_idle) = {
                    let mut jobs = shared.jobs();
                    let job = jobs.pending.remove(&job_id);
                    (job, jobs.pending.is_empty())
                };
                match job {
                    Some(job) => {
                        tracing::debug!(
                            worker = shared.id,
                            %job_id,
                            success = outcome.is_success(),
                            "Job finished"
                        );
                        job.resolve(Ok(outcome));
                    }
                    None => tracing::warn!(worker = shared.id, %job_id, "Result for unknown job"),
                }
                if now_idle {
                    shared.idle.notify_waiters();
                }
            }
            Ok(other) => {
                tracing::warn!(
                    worker = shared.id,
                    packet = ?other,
                    "Unexpected packet from context"
                );
            }
            Err(ContextError::Serialization(e)) => {
                tracing::warn!(worker = shared.id, error = %e, "Dropping undecodable packet");
            }
            Err(ContextError::Cancelled) => {
                // Killed or dropped; nobody will answer the remaining jobs.
                shared.fail_all(WorkerError::Killed);
                break;
            }
            Err(ContextError::Exited) => {
                if shared.jobs().accepting {
                    shared.fail_all(WorkerError::Exited(
                        "the task runner returned while the worker was accepting jobs".to_string(),
                    ));
                }
                break;
            }
            Err(e) => {
                tracing::warn!(worker = shared.id, error = %e, "Worker context failed");
                shared.fail_all(WorkerError::Failed(e.to_string()));
                break;
            }
        }
    }
    tracing::trace!(worker = shared.id, "Worker pump exiting");
    shared.pump_done.cancel();
}

/// Handle to one submitted job.
pub struct Execution<T: Task> {
    job_id: JobId,
    link: Link,
    result: oneshot::Receiver<JobResult>,
    messages: mpsc::UnboundedReceiver<serde_json::Value>,
    cancel: CancellationToken,
    _task: PhantomData<fn() -> T>,
}

impl<T: Task> Execution<T> {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Send an in-task message to the running job.
    pub async fn send<M: Serialize + ?Sized>(&self, value: &M) -> Result<(), ExecutionError> {
        let data = serde_json::to_value(value).map_err(SerializationError::from)?;
        self.link
            .send(&JobPacket::Message {
                job_id: self.job_id,
                data,
            })
            .await
    }

    /// Receive the next in-task message from the job.
    pub async fn receive<M: DeserializeOwned>(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<M, ExecutionError> {
        let value = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecutionError::ReceiveCancelled),
            value = self.messages.recv() => value.ok_or(ExecutionError::Finished)?,
        };
        Ok(serde_json::from_value(value).map_err(SerializationError::from)?)
    }

    /// Ask the context to cancel this job.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the job's output.
    pub async fn result(self) -> Result<T::Output, ExecutionError> {
        let outcome = match self.result.await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                let error = self
                    .link
                    .shared
                    .jobs()
                    .failure
                    .clone()
                    .unwrap_or_else(|| WorkerError::Failed("job result dropped".to_string()));
                return Err(error.into());
            }
        };
        match outcome {
            TaskOutcome::Success { value } => {
                Ok(serde_json::from_value(value).map_err(SerializationError::from)?)
            }
            TaskOutcome::Failure { failure } => Err(ExecutionError::Task(failure)),
            TaskOutcome::Cancelled { failure } => Err(ExecutionError::Cancelled(failure)),
        }
    }
}

impl<T: Task> fmt::Debug for Execution<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("job_id", &self.job_id)
            .field("task", &T::NAME)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::diagnostic::{Echo, Fail, Relay, Sleep};

    async fn worker() -> Worker {
        Worker::start(&ContextFactory::runtime(), WorkerConfig::default())
            .await
            .unwrap()
    }

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn pipelined_jobs_resolve_to_their_own_results() {
        let worker = worker().await;
        let mut executions = Vec::new();
        for i in 0..20 {
            executions.push(worker.submit(&Echo::new(i), never()).await.unwrap());
        }
        assert!(!worker.is_idle());
        for (i, execution) in executions.into_iter().enumerate() {
            assert_eq!(execution.result().await.unwrap(), serde_json::json!(i));
        }
        worker.until_idle().await;
        assert!(worker.is_idle());
    }

    #[tokio::test]
    async fn task_failure_is_a_result_not_a_worker_error() {
        let worker = worker().await;
        let err = worker
            .submit(&Fail::new("Test message"), never())
            .await
            .unwrap()
            .result()
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Task(ref f) if f.message == "Test message"));
        assert!(worker.is_running());

        let ok = worker.submit(&Echo::new("after"), never()).await.unwrap();
        assert_eq!(ok.result().await.unwrap(), serde_json::json!("after"));
    }

    #[tokio::test]
    async fn cancellation_reaches_running_job() {
        let worker = worker().await;
        let execution = worker
            .submit(&Sleep::new(Duration::from_secs(30)), never())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        execution.cancel();

        let err = tokio::time::timeout(Duration::from_secs(5), execution.result())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled(_)), "{err}");
    }

    #[tokio::test]
    async fn in_task_messages_are_routed_by_job() {
        let worker = worker().await;
        let mut first = worker
            .submit(&Relay { limit: Some(1) }, never())
            .await
            .unwrap();
        let mut second = worker
            .submit(&Relay { limit: Some(1) }, never())
            .await
            .unwrap();

        // The second job is still queued; its message waits for it.
        second.send(&"for second").await.unwrap();
        first.send(&"for first").await.unwrap();

        assert_eq!(first.receive::<String>(&never()).await.unwrap(), "for first");
        assert_eq!(second.receive::<String>(&never()).await.unwrap(), "for second");
        assert_eq!(first.result().await.unwrap(), 1);
        assert!(matches!(
            second.receive::<String>(&never()).await,
            Err(ExecutionError::Finished)
        ));
    }

    #[tokio::test]
    async fn kill_fails_pending_jobs() {
        let worker = worker().await;
        let execution = worker
            .submit(&Sleep::new(Duration::from_secs(30)), never())
            .await
            .unwrap();
        worker.kill();

        let err = execution.result().await.unwrap_err();
        assert_eq!(err.to_string(), "the worker was killed");
        assert!(!worker.is_running());
        assert!(matches!(
            worker.submit(&Echo::new(1), never()).await,
            Err(ExecutionError::Worker(WorkerError::Killed))
        ));
    }

    #[tokio::test]
    async fn broken_context_fails_worker_permanently() {
        let worker = worker().await;
        let execution = worker
            .submit(&Sleep::new(Duration::from_secs(30)), never())
            .await
            .unwrap();
        worker.context().close();

        let err = execution.result().await.unwrap_err();
        assert!(matches!(err, ExecutionError::Worker(WorkerError::Failed(_))), "{err}");
        let again = worker.submit(&Echo::new(1), never()).await.unwrap_err();
        assert!(matches!(again, ExecutionError::Worker(WorkerError::Failed(_))));
    }

    #[tokio::test]
    async fn abandoned_job_does_not_keep_worker_busy() {
        let worker = worker().await;
        let shared = &worker.link.shared;
        let job_id = JobId(shared.next_job.fetch_add(1, Ordering::Relaxed));
        let (result, _result_rx) = oneshot::channel();
        let (messages, _messages_rx) = mpsc::unbounded_channel();
        shared.jobs().pending.insert(
            job_id,
            PendingJob {
                result,
                messages,
                finished: CancellationToken::new(),
            },
        );
        assert!(!worker.is_idle());

        let abandon = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            shared.abandon(job_id);
        };
        tokio::time::timeout(Duration::from_secs(1), async {
            tokio::join!(worker.until_idle(), abandon)
        })
        .await
        .unwrap();
        assert!(worker.is_idle());
        assert!(worker.is_running());
        let ok = worker
            .submit(&Echo::new("still usable"), never())
            .await
            .unwrap();
        assert_eq!(ok.result().await.unwrap(), serde_json::json!("still usable"));
    }

    #[tokio::test]
    async fn shutdown_drains_then_refuses() {
        let worker = worker().await;
        let execution = worker
            .submit(&Sleep::new(Duration::from_millis(50)), never())
            .await
            .unwrap();

        worker.shutdown().await.unwrap();
        assert_eq!(execution.result().await.unwrap(), 50);
        assert!(matches!(
            worker.submit(&Echo::new(1), never()).await,
            Err(ExecutionError::Worker(WorkerError::ShuttingDown))
        ));
    }

    #[tokio::test]
    async fn shutdown_on_thread_backend() {
        let worker = Worker::start(&ContextFactory::thread(), WorkerConfig::default())
            .await
            .unwrap();
        let out = worker.submit(&Echo::new("t"), never()).await.unwrap();
        assert_eq!(out.result().await.unwrap(), serde_json::json!("t"));
        worker.shutdown().await.unwrap();
        assert!(!worker.context().is_running());
    }
}
