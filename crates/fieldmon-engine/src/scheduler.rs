use crate::error::SubmitError;
use crate::worker::WorkerPool;
use chrono::Utc;
use fieldmon_common::{CollectionTask, Device, TaskSnapshot};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_secs(1);

/// Due-time driven task submission.
///
/// Ticks once a second, snapshots the due tasks under the read lock, then
/// submits them outside it. A submission rejected by a full queue is not
/// re-enqueued: the task stays due until a recorded outcome advances its
/// `next_run`, so under overload the effective collection rate settles at the
/// worker pool's throughput.
pub struct Scheduler {
    tasks: RwLock<HashMap<String, Arc<CollectionTask>>>,
    pool: Arc<WorkerPool>,
    default_interval: Duration,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(pool: Arc<WorkerPool>, default_interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            pool,
            default_interval,
            cancel,
        }
    }

    pub fn add_task(&self, task: Arc<CollectionTask>) {
        tracing::debug!(
            task_id = %task.task_id,
            device_id = %task.device_id,
            interval_secs = task.interval.as_secs(),
            "Task added"
        );
        self.tasks.write().insert(task.task_id.clone(), task);
    }

    pub fn remove_task(&self, task_id: &str) {
        if self.tasks.write().remove(task_id).is_some() {
            tracing::debug!(task_id = %task_id, "Task removed");
        }
    }

    /// Registers an enabled device for collection, due immediately. A zero
    /// device interval falls back to the agent default.
    pub fn add_device(&self, device: Arc<Device>) {
        if !device.enabled {
            tracing::debug!(device_id = %device.id, "Device disabled, not scheduling");
            return;
        }

        let interval = match device.interval {
            0 => self.default_interval,
            secs => Duration::from_secs(secs),
        };
        self.add_task(Arc::new(CollectionTask::new(device, interval)));
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        self.tasks.read().values().map(|t| t.snapshot()).collect()
    }

    /// The tick loop; runs until the cancellation token fires.
    pub async fn run(&self) {
        tracing::info!(
            tasks = self.task_count(),
            default_interval_secs = self.default_interval.as_secs(),
            "Scheduler started"
        );

        let mut tick = interval(TICK);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Scheduler stopping");
                    break;
                }
                _ = tick.tick() => self.submit_due(),
            }
        }
    }

    fn submit_due(&self) {
        let now = Utc::now();
        let due: Vec<Arc<CollectionTask>> = {
            let tasks = self.tasks.read();
            tasks
                .values()
                .filter(|t| t.should_run(now))
                .cloned()
                .collect()
        };

        for task in due {
            match self.pool.submit(task.clone()) {
                Ok(()) => {
                    tracing::debug!(
                        task_id = %task.task_id,
                        device_id = %task.device_id,
                        "Task submitted"
                    );
                }
                Err(SubmitError::QueueFull) => {
                    tracing::warn!(
                        task_id = %task.task_id,
                        device_id = %task.device_id,
                        "Submission rejected, queue full"
                    );
                }
                Err(SubmitError::Closed) => {
                    tracing::debug!(task_id = %task.task_id, "Worker pool closed");
                    return;
                }
            }
        }
    }
}
