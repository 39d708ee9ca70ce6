use crate::error::CollectError;
use fieldmon_common::MetricData;
use fieldmon_protocol::ProtocolError;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Seconds the breaker stays open before probing.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_timeout() -> u64 {
    60
}

fn default_half_open_max_requests() -> u32 {
    1
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout: default_timeout(),
            half_open_max_requests: default_half_open_max_requests(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    half_open_count: u32,
    last_failure: Option<Instant>,
}

/// Per-device circuit breaker.
///
/// closed -> open after `failure_threshold` consecutive failures; open ->
/// half-open once `timeout` has elapsed since the last failure; half-open ->
/// closed after `success_threshold` consecutive successes, or back to open on
/// any failure. The probe that triggers the half-open transition is admitted
/// outright; after it, at most `half_open_max_requests` further probes are
/// let through before the gate rejects again.
pub struct CircuitBreaker {
    device_id: String,
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    half_open_max_requests: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(device_id: &str, cfg: &BreakerConfig) -> Self {
        Self {
            device_id: device_id.to_string(),
            failure_threshold: cfg.failure_threshold,
            success_threshold: cfg.success_threshold,
            timeout: Duration::from_secs(cfg.timeout),
            half_open_max_requests: cfg.half_open_max_requests,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Runs `f` under breaker protection. Rejects with
    /// [`CollectError::CircuitOpen`] before calling when the gate is closed
    /// to traffic. Resource-pressure errors pass through unrecorded.
    pub async fn execute<F, Fut>(&self, f: F) -> Result<MetricData, CollectError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<MetricData, ProtocolError>>,
    {
        if !self.can_execute() {
            return Err(CollectError::CircuitOpen);
        }

        match f().await {
            Ok(data) => {
                self.record_success();
                Ok(data)
            }
            Err(e) if e.is_resource_pressure() => Err(e.into()),
            Err(e) => {
                self.record_failure();
                Err(e.into())
            }
        }
    }

    fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.timeout {
                    tracing::info!(
                        device_id = %self.device_id,
                        "Circuit breaker transitioning to half-open"
                    );
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_count = 0;
                    inner.success_count = 0;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_count < self.half_open_max_requests {
                    inner.half_open_count += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        inner.success_count = 0;

        match inner.state {
            BreakerState::Closed => {
                if inner.failure_count >= self.failure_threshold {
                    tracing::warn!(
                        device_id = %self.device_id,
                        failures = inner.failure_count,
                        threshold = self.failure_threshold,
                        "Circuit breaker opening"
                    );
                    inner.state = BreakerState::Open;
                    inner.failure_count = 0;
                }
            }
            BreakerState::HalfOpen => {
                tracing::warn!(
                    device_id = %self.device_id,
                    "Circuit breaker reopening after failed probe"
                );
                inner.state = BreakerState::Open;
                inner.failure_count = 0;
                inner.half_open_count = 0;
            }
            BreakerState::Open => {}
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.success_count += 1;
        inner.failure_count = 0;

        if inner.state == BreakerState::HalfOpen && inner.success_count >= self.success_threshold {
            tracing::info!(
                device_id = %self.device_id,
                successes = inner.success_count,
                "Circuit breaker closing"
            );
            inner.state = BreakerState::Closed;
            inner.success_count = 0;
            inner.half_open_count = 0;
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_count = 0;
        tracing::info!(device_id = %self.device_id, "Circuit breaker reset");
    }
}

/// Lazily creates one breaker per device id.
pub struct BreakerRegistry {
    cfg: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_device(&self, device_id: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(device_id, &self.cfg)))
            .clone()
    }

    /// Number of breakers currently not in the closed state.
    pub fn open_count(&self) -> usize {
        self.breakers
            .lock()
            .values()
            .filter(|b| b.state() != BreakerState::Closed)
            .count()
    }
}
