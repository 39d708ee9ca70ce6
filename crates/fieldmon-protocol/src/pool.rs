use crate::error::ProtocolError;
use crate::session::{ReadSession, SessionFactory};
use fieldmon_common::{Device, ProtocolKind};
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_max_open")]
    pub max_open: usize,
    /// Maximum session lifetime in seconds; 0 disables the check.
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime: u64,
    /// Idle timeout in seconds; 0 disables the check.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

fn default_max_idle() -> usize {
    4
}

fn default_max_open() -> usize {
    16
}

fn default_max_lifetime() -> u64 {
    3600
}

fn default_idle_timeout() -> u64 {
    600
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: default_max_idle(),
            max_open: default_max_open(),
            max_lifetime: default_max_lifetime(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

/// A session checked out of the pool. Ownership is the in-use marker: a
/// worker borrows the connection by value and gives it back with `put`.
pub struct PooledConnection {
    session: Box<dyn ReadSession>,
    device_id: String,
    created_at: Instant,
    last_used_at: Instant,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("device_id", &self.device_id)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

impl PooledConnection {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_mut(&mut self) -> &mut dyn ReadSession {
        self.session.as_mut()
    }

    fn expired(&self, max_lifetime: Duration, idle_timeout: Duration, idle: bool) -> bool {
        let now = Instant::now();
        if !max_lifetime.is_zero() && now.duration_since(self.created_at) >= max_lifetime {
            return true;
        }
        if idle && !idle_timeout.is_zero() && now.duration_since(self.last_used_at) >= idle_timeout
        {
            return true;
        }
        false
    }

    async fn teardown(mut self) {
        if let Err(e) = self.session.close().await {
            tracing::debug!(device_id = %self.device_id, error = %e, "Session close failed");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub max_open: usize,
    pub max_idle: usize,
}

struct PoolInner {
    idle: Vec<PooledConnection>,
    active: usize,
    closed: bool,
}

/// Per-protocol pool of reusable device sessions.
///
/// Affinity is strictly per-device: a session opened for device A is never
/// handed to device B. Expiry is checked on every get and every put. `get`
/// never waits; when `max_open` live sessions exist the caller sees
/// [`ProtocolError::PoolExhausted`] so backpressure reaches the scheduler.
/// Factory connects and session teardown happen outside the pool lock.
pub struct ConnectionPool {
    kind: ProtocolKind,
    max_idle: usize,
    max_open: usize,
    max_lifetime: Duration,
    idle_timeout: Duration,
    inner: Mutex<PoolInner>,
}

impl ConnectionPool {
    pub fn new(kind: ProtocolKind, cfg: &PoolConfig) -> Self {
        Self {
            kind,
            max_idle: cfg.max_idle,
            max_open: cfg.max_open,
            max_lifetime: Duration::from_secs(cfg.max_lifetime),
            idle_timeout: Duration::from_secs(cfg.idle_timeout),
            inner: Mutex::new(PoolInner {
                idle: Vec::with_capacity(cfg.max_idle),
                active: 0,
                closed: false,
            }),
        }
    }

    /// Retrieves a session for the device, reusing a non-expired idle one or
    /// opening a new session through `factory`.
    pub async fn get(
        &self,
        device: &Device,
        factory: &dyn SessionFactory,
    ) -> Result<PooledConnection, ProtocolError> {
        enum Checkout {
            Reused(PooledConnection),
            Reserve,
            Exhausted,
            Closed,
        }

        let (checkout, expired) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                (Checkout::Closed, Vec::new())
            } else {
                let expired = self.sweep_expired(&mut inner);
                if let Some(pos) = inner.idle.iter().position(|c| c.device_id == device.id) {
                    let mut conn = inner.idle.remove(pos);
                    conn.last_used_at = Instant::now();
                    inner.active += 1;
                    tracing::debug!(
                        protocol = %self.kind,
                        device_id = %device.id,
                        active = inner.active,
                        idle = inner.idle.len(),
                        "Reused pooled session"
                    );
                    (Checkout::Reused(conn), expired)
                } else if inner.active + inner.idle.len() >= self.max_open {
                    tracing::warn!(
                        protocol = %self.kind,
                        active = inner.active,
                        max_open = self.max_open,
                        "Connection pool exhausted"
                    );
                    (Checkout::Exhausted, expired)
                } else {
                    // Reserve the slot before connecting so concurrent gets
                    // cannot overshoot max_open while the factory call runs
                    // unlocked.
                    inner.active += 1;
                    (Checkout::Reserve, expired)
                }
            }
        };

        for conn in expired {
            conn.teardown().await;
        }

        match checkout {
            Checkout::Closed => Err(ProtocolError::PoolClosed),
            Checkout::Exhausted => Err(ProtocolError::PoolExhausted),
            Checkout::Reused(conn) => Ok(conn),
            Checkout::Reserve => match factory.connect(device).await {
                Ok(session) => {
                    tracing::debug!(
                        protocol = %self.kind,
                        device_id = %device.id,
                        "Opened new session"
                    );
                    Ok(PooledConnection {
                        session,
                        device_id: device.id.clone(),
                        created_at: Instant::now(),
                        last_used_at: Instant::now(),
                    })
                }
                Err(e) => {
                    self.inner.lock().active -= 1;
                    Err(e)
                }
            },
        }
    }

    /// Returns a session to the pool; expired or surplus sessions are torn
    /// down instead of being kept.
    pub async fn put(&self, mut conn: PooledConnection) {
        let retire = {
            let mut inner = self.inner.lock();
            inner.active = inner.active.saturating_sub(1);
            if inner.closed {
                true
            } else if conn.expired(self.max_lifetime, self.idle_timeout, false) {
                tracing::debug!(
                    protocol = %self.kind,
                    device_id = %conn.device_id,
                    "Retiring expired session"
                );
                true
            } else if inner.idle.len() < self.max_idle {
                conn.last_used_at = Instant::now();
                inner.idle.push(conn);
                return;
            } else {
                tracing::debug!(
                    protocol = %self.kind,
                    device_id = %conn.device_id,
                    "Idle list full, closing session"
                );
                true
            }
        };
        if retire {
            conn.teardown().await;
        }
    }

    fn sweep_expired(&self, inner: &mut PoolInner) -> Vec<PooledConnection> {
        let mut expired = Vec::new();
        let mut i = 0;
        while i < inner.idle.len() {
            if inner.idle[i].expired(self.max_lifetime, self.idle_timeout, true) {
                expired.push(inner.idle.remove(i));
            } else {
                i += 1;
            }
        }
        expired
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            active: inner.active,
            idle: inner.idle.len(),
            max_open: self.max_open,
            max_idle: self.max_idle,
        }
    }

    /// Idempotent; tears down every idle session. Sessions still borrowed
    /// are torn down when they come back through `put`.
    pub async fn close(&self) {
        let idle = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            std::mem::take(&mut inner.idle)
        };
        for conn in idle {
            conn.teardown().await;
        }
        tracing::info!(protocol = %self.kind, "Connection pool closed");
    }
}
