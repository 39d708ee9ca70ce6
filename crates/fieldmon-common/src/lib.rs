//! Shared data model for the fieldmon collector agent.
//!
//! Everything that crosses a crate boundary lives here: devices and their
//! metric definitions, collected metric data with per-point and aggregate
//! quality, and the scheduled collection task with its run bookkeeping.

pub mod task;
pub mod types;

pub use task::{CollectionTask, TaskSnapshot, TaskStatus};
pub use types::{
    ConnectionConfig, DataType, Device, DeviceHealth, HealthStatus, MetricData, MetricDefinition,
    MetricValue, PointQuality, ProtocolKind, Quality, Value,
};
