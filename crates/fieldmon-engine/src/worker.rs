use crate::breaker::BreakerRegistry;
use crate::error::{CollectError, SubmitError, TaskError};
use fieldmon_common::{CollectionTask, MetricData, ProtocolKind};
use fieldmon_protocol::{Protocol, ProtocolError};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const DEFAULT_COLLECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerPoolConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_size() -> usize {
    200
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            queue_size: default_queue_size(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    active: AtomicUsize,
    total_duration_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolStats {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub active_workers: usize,
    pub queued_tasks: usize,
    pub total_duration_ms: u64,
}

/// Bounded-concurrency executor for collection tasks.
///
/// `worker_count` long-lived workers drain a bounded FIFO task queue. An
/// explicit semaphore of the same size caps in-flight collects so the cap
/// survives if workers are ever replaced by lightweight per-task handlers.
/// Results and task errors fan out on their own bounded channels; the
/// channels close when the last worker exits, which is what ends the agent's
/// fan-in loops.
pub struct WorkerPool {
    cfg: WorkerPoolConfig,
    protocols: Arc<HashMap<ProtocolKind, Arc<dyn Protocol>>>,
    breakers: Arc<BreakerRegistry>,
    task_tx: mpsc::Sender<Arc<CollectionTask>>,
    task_rx: parking_lot::Mutex<Option<mpsc::Receiver<Arc<CollectionTask>>>>,
    result_tx: parking_lot::Mutex<Option<mpsc::Sender<MetricData>>>,
    result_rx: parking_lot::Mutex<Option<mpsc::Receiver<MetricData>>>,
    error_tx: parking_lot::Mutex<Option<mpsc::Sender<TaskError>>>,
    error_rx: parking_lot::Mutex<Option<mpsc::Receiver<TaskError>>>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    workers: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(
        cfg: WorkerPoolConfig,
        protocols: Arc<HashMap<ProtocolKind, Arc<dyn Protocol>>>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::channel(cfg.queue_size.max(1));
        let (result_tx, result_rx) = mpsc::channel(cfg.queue_size.max(1) * 2);
        let (error_tx, error_rx) = mpsc::channel(cfg.queue_size.max(1));

        Self {
            semaphore: Arc::new(Semaphore::new(cfg.worker_count.max(1))),
            cfg,
            protocols,
            breakers,
            task_tx,
            task_rx: parking_lot::Mutex::new(Some(task_rx)),
            result_tx: parking_lot::Mutex::new(Some(result_tx)),
            result_rx: parking_lot::Mutex::new(Some(result_rx)),
            error_tx: parking_lot::Mutex::new(Some(error_tx)),
            error_rx: parking_lot::Mutex::new(Some(error_rx)),
            cancel: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
            workers: parking_lot::Mutex::new(None),
        }
    }

    /// Takes the result channel; call once before `start`.
    pub fn take_results(&self) -> Option<mpsc::Receiver<MetricData>> {
        self.result_rx.lock().take()
    }

    /// Takes the error channel; call once before `start`.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<TaskError>> {
        self.error_rx.lock().take()
    }

    /// Non-blocking submission. A full queue drops the newest task; the
    /// scheduler resubmits it at the next tick.
    pub fn submit(&self, task: Arc<CollectionTask>) -> Result<(), SubmitError> {
        match self.task_tx.try_send(task) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(task)) => {
                tracing::warn!(
                    device_id = %task.device_id,
                    "Task queue full, dropping task"
                );
                Err(SubmitError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::Closed),
        }
    }

    pub fn start(&self) {
        tracing::info!(
            workers = self.cfg.worker_count,
            queue_size = self.cfg.queue_size,
            "Starting worker pool"
        );

        let task_rx = match self.task_rx.lock().take() {
            Some(rx) => Arc::new(tokio::sync::Mutex::new(rx)),
            None => {
                tracing::warn!("Worker pool already started");
                return;
            }
        };
        // Workers own the only senders so both channels close when the last
        // worker exits.
        let result_tx = self.result_tx.lock().take();
        let error_tx = self.error_tx.lock().take();
        let (Some(result_tx), Some(error_tx)) = (result_tx, error_tx) else {
            return;
        };

        let mut workers = JoinSet::new();
        for worker_id in 0..self.cfg.worker_count.max(1) {
            let ctx = WorkerContext {
                worker_id,
                task_rx: task_rx.clone(),
                result_tx: result_tx.clone(),
                error_tx: error_tx.clone(),
                semaphore: self.semaphore.clone(),
                protocols: self.protocols.clone(),
                breakers: self.breakers.clone(),
                counters: self.counters.clone(),
                cancel: self.cancel.clone(),
            };
            workers.spawn(ctx.run());
        }
        *self.workers.lock() = Some(workers);
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            tasks_submitted: self.counters.submitted.load(Ordering::Relaxed),
            tasks_completed: self.counters.completed.load(Ordering::Relaxed),
            tasks_failed: self.counters.failed.load(Ordering::Relaxed),
            active_workers: self.counters.active.load(Ordering::Relaxed),
            queued_tasks: self.cfg.queue_size.saturating_sub(self.task_tx.capacity()),
            total_duration_ms: self.counters.total_duration_ms.load(Ordering::Relaxed),
        }
    }

    /// Cancels the workers and waits for in-flight collects to finish.
    pub async fn stop(&self) {
        tracing::info!("Stopping worker pool");
        self.cancel.cancel();

        let workers = self.workers.lock().take();
        if let Some(mut workers) = workers {
            while workers.join_next().await.is_some() {}
        }

        let stats = self.stats();
        tracing::info!(
            tasks_submitted = stats.tasks_submitted,
            tasks_completed = stats.tasks_completed,
            tasks_failed = stats.tasks_failed,
            "Worker pool stopped"
        );
    }
}

struct WorkerContext {
    worker_id: usize,
    task_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<CollectionTask>>>>,
    result_tx: mpsc::Sender<MetricData>,
    error_tx: mpsc::Sender<TaskError>,
    semaphore: Arc<Semaphore>,
    protocols: Arc<HashMap<ProtocolKind, Arc<dyn Protocol>>>,
    breakers: Arc<BreakerRegistry>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl WorkerContext {
    async fn run(self) {
        tracing::debug!(worker_id = self.worker_id, "Worker started");

        loop {
            let task = {
                let mut rx = self.task_rx.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    task = rx.recv() => task,
                }
            };
            let Some(task) = task else {
                break;
            };

            let permit = match self.semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            self.counters.active.fetch_add(1, Ordering::Relaxed);

            let started = Instant::now();
            let outcome = self.execute(&task).await;
            let elapsed = started.elapsed();

            drop(permit);
            self.counters.active.fetch_sub(1, Ordering::Relaxed);
            self.counters
                .total_duration_ms
                .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);

            match outcome {
                Ok(data) => {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    task.record_success();
                    task.device.health.record_success();
                    if self.result_tx.send(data).await.is_err() {
                        break;
                    }
                    tracing::debug!(
                        worker_id = self.worker_id,
                        device_id = %task.device_id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Task completed"
                    );
                }
                Err(error) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    if error.is_device_failure() {
                        task.device.health.record_failure();
                        tracing::error!(
                            worker_id = self.worker_id,
                            device_id = %task.device_id,
                            error = %error,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Task failed"
                        );
                    } else {
                        tracing::debug!(
                            worker_id = self.worker_id,
                            device_id = %task.device_id,
                            error = %error,
                            "Task deferred"
                        );
                    }
                    task.record_failure();
                    if self.error_tx.send(TaskError { task, error }).await.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(worker_id = self.worker_id, "Worker stopped");
    }

    async fn execute(&self, task: &Arc<CollectionTask>) -> Result<MetricData, CollectError> {
        let device = &task.device;
        let protocol = self
            .protocols
            .get(&device.protocol)
            .ok_or_else(|| CollectError::UnsupportedProtocol(device.protocol.to_string()))?
            .clone();

        let timeout = match device.connection_config.timeout {
            0 => DEFAULT_COLLECT_TIMEOUT,
            secs => Duration::from_secs(secs),
        };

        let breaker = self.breakers.for_device(&device.id);
        breaker
            .execute(|| async {
                match tokio::time::timeout(timeout, protocol.collect(device)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProtocolError::Timeout(timeout)),
                }
            })
            .await
    }
}
