use crate::types::Device;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Success,
    Failure,
    Never,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failure => write!(f, "failure"),
            TaskStatus::Never => write!(f, "never"),
        }
    }
}

/// The scheduled intent to collect one device's metrics.
///
/// Shared between the scheduler map and the workers as `Arc<CollectionTask>`;
/// the mutable run bookkeeping sits behind a mutex. `next_run` only advances
/// when a terminal outcome is recorded, never on submission, so a task whose
/// submission was rejected is naturally retried on the next scheduler tick.
#[derive(Debug)]
pub struct CollectionTask {
    pub task_id: String,
    pub device_id: String,
    pub device: Arc<Device>,
    pub interval: std::time::Duration,
    state: Mutex<TaskState>,
}

#[derive(Debug, Clone)]
struct TaskState {
    enabled: bool,
    next_run: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
    last_status: TaskStatus,
    run_count: u64,
    error_count: u64,
}

#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub device_id: String,
    pub enabled: bool,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: TaskStatus,
    pub run_count: u64,
    pub error_count: u64,
}

impl CollectionTask {
    /// Creates a task due immediately: devices are collected once on start.
    pub fn new(device: Arc<Device>, interval: std::time::Duration) -> Self {
        Self {
            task_id: format!("task-{}", device.id),
            device_id: device.id.clone(),
            interval,
            state: Mutex::new(TaskState {
                enabled: true,
                next_run: Utc::now(),
                last_run: None,
                last_status: TaskStatus::Never,
                run_count: 0,
                error_count: 0,
            }),
            device,
        }
    }

    pub fn should_run(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.lock();
        state.enabled && now >= state.next_run
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.last_run = Some(Utc::now());
        state.last_status = TaskStatus::Success;
        state.run_count += 1;
        state.next_run = Utc::now() + self.step();
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.last_run = Some(Utc::now());
        state.last_status = TaskStatus::Failure;
        state.error_count += 1;
        state.next_run = Utc::now() + self.step();
    }

    fn step(&self) -> Duration {
        Duration::from_std(self.interval).unwrap_or_else(|_| Duration::seconds(1))
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    pub fn next_run(&self) -> DateTime<Utc> {
        self.state.lock().next_run
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock();
        TaskSnapshot {
            task_id: self.task_id.clone(),
            device_id: self.device_id.clone(),
            enabled: state.enabled,
            next_run: state.next_run,
            last_run: state.last_run,
            last_status: state.last_status,
            run_count: state.run_count,
            error_count: state.error_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProtocolKind;
    use std::time::Duration as StdDuration;

    fn device(id: &str) -> Arc<Device> {
        Arc::new(Device {
            id: id.to_string(),
            name: id.to_string(),
            ip: "127.0.0.1".to_string(),
            port: 4840,
            protocol: ProtocolKind::Sim,
            enabled: true,
            connection_config: Default::default(),
            metrics: Vec::new(),
            interval: 0,
            tags: Default::default(),
            health: Default::default(),
        })
    }

    #[test]
    fn new_task_is_due_immediately() {
        let task = CollectionTask::new(device("plc-1"), StdDuration::from_secs(5));
        assert!(task.should_run(Utc::now()));
        assert_eq!(task.snapshot().last_status, TaskStatus::Never);
    }

    #[test]
    fn outcomes_advance_next_run_by_one_interval() {
        let task = CollectionTask::new(device("plc-1"), StdDuration::from_secs(5));

        let before = task.next_run();
        task.record_success();
        let after_success = task.next_run();
        assert!(after_success > before);
        assert!(!task.should_run(Utc::now()));

        task.record_failure();
        let after_failure = task.next_run();
        assert!(after_failure >= after_success);

        let snapshot = task.snapshot();
        assert_eq!(snapshot.run_count, 1);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.last_status, TaskStatus::Failure);
    }

    #[test]
    fn disabled_task_never_runs() {
        let task = CollectionTask::new(device("plc-1"), StdDuration::from_secs(5));
        task.set_enabled(false);
        assert!(!task.should_run(Utc::now()));
    }
}
