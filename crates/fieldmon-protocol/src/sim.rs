//! Deterministic simulated devices.
//!
//! The simulator stands in for a real transport during development and in
//! tests. Behavior is driven by the device and node ids alone so runs are
//! reproducible:
//!
//! - a device tagged `sim.unreachable` refuses to connect;
//! - node ids prefixed `bad:` read back with bad quality;
//! - node ids prefixed `err:` fail the whole batched read;
//! - node ids prefixed `bool:` / `int:` / `str:` produce typed waveforms;
//! - anything else produces a slowly drifting float.

use crate::error::ProtocolError;
use crate::session::{NodeReading, ReadSession, SessionFactory};
use async_trait::async_trait;
use fieldmon_common::{Device, PointQuality, Value};

pub struct SimSessionFactory;

#[async_trait]
impl SessionFactory for SimSessionFactory {
    async fn connect(&self, device: &Device) -> Result<Box<dyn ReadSession>, ProtocolError> {
        if device.tags.contains_key("sim.unreachable") {
            return Err(ProtocolError::Session(format!(
                "connect to {}:{} refused",
                device.ip, device.port
            )));
        }
        Ok(Box::new(SimSession {
            device_id: device.id.clone(),
            tick: 0,
        }))
    }
}

pub struct SimSession {
    device_id: String,
    tick: u64,
}

impl SimSession {
    fn reading(&self, node_id: &str) -> Result<NodeReading, ProtocolError> {
        if let Some(rest) = node_id.strip_prefix("err:") {
            return Err(ProtocolError::Session(format!(
                "read of {rest} failed on {}",
                self.device_id
            )));
        }

        let (value, quality) = if node_id.starts_with("bad:") {
            (None, PointQuality::Bad)
        } else if node_id.starts_with("bool:") {
            (Some(Value::Bool(self.tick % 2 == 0)), PointQuality::Good)
        } else if node_id.starts_with("int:") {
            (Some(Value::Int(self.tick as i64)), PointQuality::Good)
        } else if node_id.starts_with("str:") {
            (
                Some(Value::Text(format!("tick-{}", self.tick))),
                PointQuality::Good,
            )
        } else {
            let base = node_id.bytes().fold(0u64, |acc, b| acc.wrapping_add(b as u64)) % 100;
            (
                Some(Value::Float(base as f64 + self.tick as f64 * 0.5)),
                PointQuality::Good,
            )
        };

        Ok(NodeReading {
            node_id: node_id.to_string(),
            value,
            quality,
        })
    }
}

#[async_trait]
impl ReadSession for SimSession {
    async fn read(&mut self, node_ids: &[String]) -> Result<Vec<NodeReading>, ProtocolError> {
        self.tick += 1;
        node_ids.iter().map(|id| self.reading(id)).collect()
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }
}
