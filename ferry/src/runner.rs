//! Job loop hosted inside a worker's context.
//!
//! Receives [`JobPacket`]s from the parent and runs submitted tasks one at a
//! time. In-task messages flow both ways while a job runs; a job's queued
//! messages are always flushed before its result.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::bridge::ChannelError;
use crate::bridge::protocol::{JobId, JobPacket, TaskEnvelope, TaskOutcome};
use crate::exit::Failure;
use crate::task::{ErasedTask, TaskChannel, TaskRegistry, TaskSender};

/// Registry name of the job loop.
pub const RUNNER_NAME: &str = "ferry.runner";

/// Entry task of worker contexts. Returns the number of jobs it completed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRunner {}

impl TaskRunner {
    pub fn envelope() -> TaskEnvelope {
        TaskEnvelope {
            name: RUNNER_NAME.to_string(),
            payload: serde_json::json!({}),
        }
    }
}

struct QueuedJob {
    job_id: JobId,
    task: TaskEnvelope,
    inbox: mpsc::UnboundedReceiver<serde_json::Value>,
    cancel: CancellationToken,
}

struct RunningJob {
    job_id: JobId,
    cancel: CancellationToken,
    outbound: mpsc::UnboundedReceiver<serde_json::Value>,
    handle: JoinHandle<Result<serde_json::Value, Failure>>,
}

enum JobEvent {
    Message(serde_json::Value),
    Finished(Result<Result<serde_json::Value, Failure>, JoinError>),
}

impl RunningJob {
    fn start(job: QueuedJob, registry: &Arc<TaskRegistry>) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let channel = TaskChannel::new(job.inbox, out_tx);
        let registry = Arc::clone(registry);
        let cancel = job.cancel.clone();
        let task = job.task;
        let handle = tokio::spawn(async move { registry.run(task, channel, cancel).await });

        Self {
            job_id: job.job_id,
            cancel: job.cancel,
            outbound: out_rx,
            handle,
        }
    }

    /// Next message from the task, or its completion once all messages are out.
    async fn next_event(&mut self) -> JobEvent {
        tokio::select! {
            biased;
            Some(value) = self.outbound.recv() => JobEvent::Message(value),
            result = &mut self.handle => JobEvent::Finished(result),
        }
    }

    fn outcome(
        &self,
        result: Result<Result<serde_json::Value, Failure>, JoinError>,
    ) -> TaskOutcome {
        match result {
            Ok(Ok(value)) => TaskOutcome::Success { value },
            Ok(Err(failure)) if failure.is_cancellation() || self.cancel.is_cancelled() => {
                TaskOutcome::Cancelled { failure }
            }
            Ok(Err(failure)) => TaskOutcome::Failure { failure },
            Err(e) if e.is_panic() => TaskOutcome::Failure {
                failure: Failure::from_panic(e.into_panic()),
            },
            Err(_) => TaskOutcome::Cancelled {
                failure: Failure::cancelled(),
            },
        }
    }
}

#[async_trait]
impl ErasedTask for TaskRunner {
    async fn run(
        self: Box<Self>,
        mut channel: TaskChannel,
        cancel: CancellationToken,
        registry: Arc<TaskRegistry>,
    ) -> Result<serde_json::Value, Failure> {
        let outbound = channel.sender();
        let mut inboxes: HashMap<JobId, mpsc::UnboundedSender<serde_json::Value>> = HashMap::new();
        let mut queue: VecDeque<QueuedJob> = VecDeque::new();
        let mut running: Option<RunningJob> = None;
        let mut shutting_down = false;
        let mut completed: u64 = 0;

        tracing::debug!("Task runner started");

        loop {
            if running.is_none() {
                if let Some(job) = queue.pop_front() {
                    tracing::trace!(job_id = %job.job_id, "Starting job");
                    running = Some(RunningJob::start(job, &registry));
                } else if shutting_down {
                    break;
                }
            }

            tokio::select! {
                packet = channel.receive::<JobPacket>(&cancel) => {
                    match packet {
                        Ok(JobPacket::Submit { job_id, task }) => {
                            tracing::debug!(%job_id, task = %task.name, "Job submitted");
                            let (tx, rx) = mpsc::unbounded_channel();
                            inboxes.insert(job_id, tx);
                            queue.push_back(QueuedJob {
                                job_id,
                                task,
                                inbox: rx,
                                cancel: CancellationToken::new(),
                            });
                        }
                        Ok(JobPacket::Message { job_id, data }) => {
                            match inboxes.get(&job_id) {
                                Some(inbox) => {
                                    let _ = inbox.send(data);
                                }
                                None => {
                                    tracing::debug!(%job_id, "Message for finished job dropped");
                                }
                            }
                        }
                        Ok(JobPacket::Cancel { job_id }) => {
                            if let Some(job) = running.as_ref().filter(|r| r.job_id == job_id) {
                                tracing::trace!(%job_id, "Cancelling running job");
                                job.cancel.cancel();
                            } else if let Some(pos) =
                                queue.iter().position(|q| q.job_id == job_id)
                            {
                                tracing::trace!(%job_id, "Cancelling queued job");
                                queue.remove(pos);
                                inboxes.remove(&job_id);
                                let outcome = TaskOutcome::Cancelled {
                                    failure: Failure::cancelled(),
                                };
                                let packet = JobPacket::Result { job_id, outcome };
                                if send_packet(&outbound, packet).is_err() {
                                    break;
                                }
                            } else {
                                tracing::trace!(%job_id, "Cancel for unknown job ignored");
                            }
                        }
                        Ok(JobPacket::Shutdown) => {
                            tracing::info!(
                                queued = queue.len(),
                                running = running.is_some(),
                                "Shutdown requested"
                            );
                            shutting_down = true;
                        }
                        Ok(JobPacket::Result { job_id, .. }) => {
                            tracing::warn!(%job_id, "Unexpected result packet from parent");
                        }
                        Err(ChannelError::Serialization(e)) => {
                            tracing::warn!(error = %e, "Dropping undecodable job packet");
                        }
                        Err(ChannelError::Cancelled) => {
                            if let Some(job) = running.take() {
                                job.cancel.cancel();
                                job.handle.abort();
                            }
                            return Err(Failure::cancelled());
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Job channel closed, stopping runner");
                            break;
                        }
                    }
                }

                event = next_event(&mut running) => {
                    let Some(job) = running.as_mut() else { continue };
                    match event {
                        JobEvent::Message(data) => {
                            let packet = JobPacket::Message { job_id: job.job_id, data };
                            if send_packet(&outbound, packet).is_err() {
                                break;
                            }
                        }
                        JobEvent::Finished(result) => {
                            let outcome = job.outcome(result);
                            let job_id = job.job_id;
                            // Late messages from helpers still holding a sender.
                            let mut late = Vec::new();
                            while let Ok(data) = job.outbound.try_recv() {
                                late.push(JobPacket::Message { job_id, data });
                            }
                            running = None;
                            inboxes.remove(&job_id);
                            completed += 1;

                            tracing::debug!(
                                %job_id,
                                success = outcome.is_success(),
                                "Job finished"
                            );
                            late.push(JobPacket::Result { job_id, outcome });
                            if late.into_iter().any(|p| send_packet(&outbound, p).is_err()) {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if let Some(job) = running.take() {
            job.cancel.cancel();
            job.handle.abort();
        }
        tracing::debug!(completed, "Task runner stopped");
        Ok(serde_json::Value::from(completed))
    }
}

async fn next_event(running: &mut Option<RunningJob>) -> JobEvent {
    match running {
        Some(job) => job.next_event().await,
        None => std::future::pending().await,
    }
}

fn send_packet(outbound: &TaskSender, packet: JobPacket) -> Result<(), ChannelError> {
    outbound.send(&packet).inspect_err(|e| {
        tracing::debug!(error = %e, "Parent channel gone, stopping runner");
    })
}
