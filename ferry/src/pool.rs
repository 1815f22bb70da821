//! Worker pool: a bounded set of reusable workers shared by many submissions.
//!
//! Capacity is a fair semaphore with one permit per worker slot. A submission
//! holds its permit for as long as its worker is busy, so the number of live
//! workers never exceeds `max` and waiting submissions are served in order.
//! Workers are started lazily and go back to the idle set when their job ends.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::config::{available_parallelism, env_duration_ms, env_usize};
use crate::context::ContextFactory;
use crate::exit::Failure;
use crate::task::Task;
use crate::worker::{Execution, ExecutionError, Worker, WorkerConfig, WorkerError};

/// Creates the workers a pool runs on.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn create(&self) -> Result<Worker, WorkerError>;
}

/// Starts workers on contexts from a [`ContextFactory`].
#[derive(Debug, Clone)]
pub struct ContextWorkerFactory {
    factory: ContextFactory,
    config: WorkerConfig,
}

impl ContextWorkerFactory {
    pub fn new(factory: ContextFactory, config: WorkerConfig) -> Self {
        Self { factory, config }
    }
}

#[async_trait]
impl WorkerFactory for ContextWorkerFactory {
    async fn create(&self) -> Result<Worker, WorkerError> {
        Worker::start(&self.factory, self.config.clone()).await
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle workers kept warm; never retired.
    pub min: usize,
    /// Upper bound on live workers.
    pub max: usize,
    /// Retire workers above `min` after this long idle. `None` keeps them.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: available_parallelism(),
            idle_timeout: None,
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max) = env_usize("FERRY_POOL_MAX").filter(|&n| n > 0) {
            config.max = max;
        }
        if let Some(min) = env_usize("FERRY_POOL_MIN") {
            config.min = min;
        }
        config.idle_timeout =
            env_duration_ms("FERRY_POOL_IDLE_TIMEOUT_MS").filter(|d| !d.is_zero());
        config
    }

    pub fn with_max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    pub fn with_min(mut self, min: usize) -> Self {
        self.min = min;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    fn normalized(mut self) -> Self {
        self.max = self.max.max(1);
        self.min = self.min.min(self.max);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("{} worker(s) failed to shut down: {}", .0.len(), join_errors(.0))]
    Shutdown(Vec<WorkerError>),
}

fn join_errors(errors: &[WorkerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

struct IdleWorker {
    worker: Arc<Worker>,
    since: Instant,
}

struct PoolState {
    idle: VecDeque<IdleWorker>,
    /// Every live worker, idle or busy.
    workers: Vec<Arc<Worker>>,
    shutting_down: bool,
}

impl PoolState {
    fn forget(&mut self, worker: &Arc<Worker>) {
        self.workers.retain(|w| !Arc::ptr_eq(w, worker));
        self.idle.retain(|idle| !Arc::ptr_eq(&idle.worker, worker));
    }
}

struct PoolInner {
    factory: Arc<dyn WorkerFactory>,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    state: Mutex<PoolState>,
    reaper_stop: CancellationToken,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Pool state mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// An idle healthy worker, or a fresh one. Caller holds a slot permit.
    async fn checkout(&self) -> Result<Arc<Worker>, WorkerError> {
        loop {
            let candidate = {
                let mut state = self.state();
                if state.shutting_down {
                    return Err(WorkerError::ShuttingDown);
                }
                state.idle.pop_back()
            };
            match candidate {
                Some(IdleWorker { worker, .. }) if worker.is_running() => return Ok(worker),
                Some(IdleWorker { worker, .. }) => {
                    tracing::debug!(worker = worker.id(), "Discarding broken idle worker");
                    self.state().forget(&worker);
                    worker.kill();
                }
                None => break,
            }
        }

        let worker = Arc::new(self.factory.create().await?);
        let mut state = self.state();
        if state.shutting_down {
            drop(state);
            worker.kill();
            return Err(WorkerError::ShuttingDown);
        }
        state.workers.push(Arc::clone(&worker));
        tracing::debug!(worker = worker.id(), live = state.workers.len(), "Pool started worker");
        Ok(worker)
    }

    /// Hand a worker back after its job, releasing the slot.
    fn checkin(&self, worker: Arc<Worker>, permit: OwnedSemaphorePermit) {
        let mut state = self.state();
        if state.shutting_down {
            // shutdown() owns the worker from here.
        } else if worker.is_running() {
            state.idle.push_back(IdleWorker {
                worker,
                since: Instant::now(),
            });
        } else {
            tracing::debug!(
                worker = worker.id(),
                failure = ?worker.failure(),
                "Dropping failed worker"
            );
            state.forget(&worker);
            drop(state);
            worker.kill();
        }
        drop(permit);
    }

    /// Retire workers above `min` that have been idle longer than `timeout`.
    fn retire_idle(&self, timeout: Duration) -> Vec<Arc<Worker>> {
        let mut state = self.state();
        let mut retired = Vec::new();
        while state.workers.len() > self.config.min {
            // Oldest idle worker sits at the front.
            match state.idle.front() {
                Some(idle) if idle.since.elapsed() >= timeout => {}
                _ => break,
            }
            if let Some(IdleWorker { worker, .. }) = state.idle.pop_front() {
                state.forget(&worker);
                retired.push(worker);
            }
        }
        retired
    }
}

/// A bounded pool of workers.
///
/// Cheap to clone; clones share the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Must be called within a tokio runtime when `idle_timeout` is set.
    pub fn new(factory: Arc<dyn WorkerFactory>, config: PoolConfig) -> Self {
        let config = config.normalized();
        let inner = Arc::new(PoolInner {
            factory,
            slots: Arc::new(Semaphore::new(config.max)),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                workers: Vec::new(),
                shutting_down: false,
            }),
            reaper_stop: CancellationToken::new(),
            config,
        });
        if let Some(timeout) = inner.config.idle_timeout {
            tokio::spawn(run_reaper(Arc::downgrade(&inner), timeout));
        }
        Self { inner }
    }

    /// Pool over contexts from `factory`.
    pub fn with_contexts(
        factory: ContextFactory,
        worker: WorkerConfig,
        config: PoolConfig,
    ) -> Self {
        Self::new(Arc::new(ContextWorkerFactory::new(factory, worker)), config)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Start workers until `min` are live.
    ///
    /// Each start holds a free slot, so warm-up never pushes the pool past
    /// `max`. It stops early when every slot is taken by a submission.
    pub async fn warm_up(&self) -> Result<(), WorkerError> {
        loop {
            let permit = match Arc::clone(&self.inner.slots).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => return Ok(()),
                Err(TryAcquireError::Closed) => return Err(WorkerError::ShuttingDown),
            };
            if self.worker_count() >= self.inner.config.min {
                return Ok(());
            }

            let worker = Arc::new(self.inner.factory.create().await?);
            let mut state = self.inner.state();
            if state.shutting_down {
                drop(state);
                worker.kill();
                return Err(WorkerError::ShuttingDown);
            }
            state.workers.push(Arc::clone(&worker));
            state.idle.push_back(IdleWorker {
                worker,
                since: Instant::now(),
            });
            drop(state);
            drop(permit);
        }
    }

    /// Run `task` on an idle worker, starting one if the pool has room, or
    /// wait in line for a worker to come free.
    ///
    /// Cancelling `cancel` while waiting gives up the place in line; once the
    /// job is submitted it asks the worker to cancel it.
    pub async fn submit<T: Task>(
        &self,
        task: &T,
        cancel: CancellationToken,
    ) -> Result<Execution<T>, ExecutionError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecutionError::Cancelled(Failure::cancelled())),
            permit = Arc::clone(&self.inner.slots).acquire_owned() => {
                permit.map_err(|_| WorkerError::ShuttingDown)?
            }
        };

        let worker = self.inner.checkout().await?;
        let execution = match worker.submit(task, cancel).await {
            Ok(execution) => execution,
            Err(e) => {
                self.inner.checkin(worker, permit);
                return Err(e);
            }
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            worker.until_idle().await;
            inner.checkin(worker, permit);
        });
        Ok(execution)
    }

    /// Refuse new work, let in-flight jobs finish, and stop every worker.
    ///
    /// All workers are shut down even if some fail; the failures are reported
    /// together.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let workers = {
            let mut state = self.inner.state();
            state.shutting_down = true;
            state.idle.clear();
            std::mem::take(&mut state.workers)
        };
        self.inner.slots.close();
        self.inner.reaper_stop.cancel();
        tracing::debug!(workers = workers.len(), "Shutting down pool");

        let results = futures::future::join_all(workers.iter().map(|w| w.shutdown())).await;
        let failures: Vec<WorkerError> = results.into_iter().filter_map(Result::err).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            tracing::warn!(failed = failures.len(), "Pool shutdown had failures");
            Err(PoolError::Shutdown(failures))
        }
    }

    /// Kill every worker now. Pending jobs fail with "the worker was killed".
    pub fn kill(&self) {
        let workers = {
            let mut state = self.inner.state();
            state.shutting_down = true;
            state.idle.clear();
            std::mem::take(&mut state.workers)
        };
        self.inner.slots.close();
        self.inner.reaper_stop.cancel();
        for worker in workers {
            worker.kill();
        }
    }

    /// Live workers, idle or busy.
    pub fn worker_count(&self) -> usize {
        self.inner.state().workers.len()
    }

    pub fn idle_worker_count(&self) -> usize {
        self.inner.state().idle.len()
    }

    /// Accepting submissions.
    pub fn is_running(&self) -> bool {
        !self.inner.state().shutting_down
    }

    /// No worker is running a job.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state();
        state.idle.len() == state.workers.len()
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("WorkerPool")
            .field("config", &self.inner.config)
            .field("workers", &state.workers.len())
            .field("idle", &state.idle.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

async fn run_reaper(pool: Weak<PoolInner>, timeout: Duration) {
    let period = (timeout / 2).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let stop = match pool.upgrade() {
            Some(inner) => inner.reaper_stop.clone(),
            None => return,
        };
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(inner) = pool.upgrade() else { return };
        for worker in inner.retire_idle(timeout) {
            tracing::debug!(worker = worker.id(), "Retiring idle worker");
            tokio::spawn(async move {
                if let Err(e) = worker.shutdown().await {
                    tracing::warn!(
                        worker = worker.id(),
                        error = %e,
                        "Retired worker did not stop cleanly"
                    );
                }
            });
        }
    }
}
