use fieldmon_common::MetricData;
use parking_lot::Mutex;

/// Coarse per-item memory estimate in bytes. A finer estimator can replace
/// this without touching the flush logic.
const ITEM_MEMORY_ESTIMATE: u64 = 100;

#[derive(Default)]
struct BufferInner {
    data: Vec<MetricData>,
    memory: u64,
}

/// Mutex-protected holding area shared by the batcher's two loops.
#[derive(Default)]
pub struct MetricBuffer {
    inner: Mutex<BufferInner>,
}

impl MetricBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, metric: MetricData) {
        let mut inner = self.inner.lock();
        inner.data.push(metric);
        inner.memory += ITEM_MEMORY_ESTIMATE;
    }

    /// Atomically moves all items out and resets the counters.
    pub fn drain(&self) -> Vec<MetricData> {
        let mut inner = self.inner.lock();
        inner.memory = 0;
        std::mem::take(&mut inner.data)
    }

    /// True once the size bound or, when enabled, the memory bound is met.
    /// `max_memory_mb == 0` disables the memory trigger.
    pub fn should_flush(&self, max_size: usize, max_memory_mb: u64) -> bool {
        let inner = self.inner.lock();
        if inner.data.len() >= max_size {
            return true;
        }
        max_memory_mb > 0 && inner.memory > max_memory_mb * 1024 * 1024
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_bytes(&self) -> u64 {
        self.inner.lock().memory
    }
}
