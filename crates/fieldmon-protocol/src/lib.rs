//! Protocol abstraction for the collection engine.
//!
//! A [`Protocol`] turns a device description into one [`MetricData`] per
//! collect. The session-driven implementation in [`collect`] does this over a
//! pooled [`ReadSession`], keeping the pool itself protocol-agnostic: a
//! per-protocol [`SessionFactory`] is the only piece that knows how to open a
//! transport. The [`sim`] module provides deterministic sessions for
//! development and tests; real transports plug in through their own factory.

pub mod collect;
pub mod error;
pub mod pool;
pub mod session;
pub mod sim;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use fieldmon_common::{Device, MetricData};

pub use collect::SessionProtocol;
pub use error::ProtocolError;
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use session::{NodeReading, ReadSession, SessionFactory};

/// A protocol capability: one registered implementation per protocol tag.
#[async_trait]
pub trait Protocol: Send + Sync {
    fn name(&self) -> &str;

    /// Reads every configured metric of the device in one round-trip.
    async fn collect(&self, device: &Device) -> Result<MetricData, ProtocolError>;

    /// Releases all resources held for this protocol. Idempotent.
    async fn close(&self) -> Result<(), ProtocolError>;
}
