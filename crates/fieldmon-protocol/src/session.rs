use crate::error::ProtocolError;
use async_trait::async_trait;
use fieldmon_common::{Device, PointQuality, Value};

/// One node's outcome within a batched read. `value` is `None` when the
/// transport reported a status that denotes bad quality.
#[derive(Debug, Clone)]
pub struct NodeReading {
    pub node_id: String,
    pub value: Option<Value>,
    pub quality: PointQuality,
}

/// An open session against one device. Borrowed exclusively from the
/// connection pool for the duration of a single collect.
#[async_trait]
pub trait ReadSession: Send {
    /// Issues one batched read; the result preserves request order.
    async fn read(&mut self, node_ids: &[String]) -> Result<Vec<NodeReading>, ProtocolError>;

    async fn close(&mut self) -> Result<(), ProtocolError>;
}

/// Opens sessions for a protocol. Passed into the pool so the pool stays
/// ignorant of transports.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, device: &Device) -> Result<Box<dyn ReadSession>, ProtocolError>;
}
