use crate::error::ProtocolError;
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::session::{NodeReading, SessionFactory};
use crate::Protocol;
use async_trait::async_trait;
use chrono::Utc;
use fieldmon_common::{Device, MetricData, MetricValue, PointQuality, ProtocolKind, Quality};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Session-driven [`Protocol`] implementation.
///
/// One batched read per collect: every configured node id goes out in a
/// single request against a pooled session. Per node, a bad status drops the
/// value from the field map; good values get the scale factor applied and are
/// coerced into the declared data type. The aggregate quality is good when
/// every requested read succeeded, bad when none did, partial otherwise.
pub struct SessionProtocol {
    kind: ProtocolKind,
    pool: ConnectionPool,
    factory: Arc<dyn SessionFactory>,
}

impl SessionProtocol {
    pub fn new(kind: ProtocolKind, pool_cfg: &PoolConfig, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            kind,
            pool: ConnectionPool::new(kind, pool_cfg),
            factory,
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn assemble(&self, device: &Device, readings: Vec<NodeReading>) -> MetricData {
        let mut metrics = HashMap::with_capacity(device.metrics.len());
        let mut good = 0usize;

        for (def, reading) in device.metrics.iter().zip(readings) {
            let Some(value) = reading.value else {
                tracing::warn!(
                    device_id = %device.id,
                    metric = %def.name,
                    quality = %reading.quality,
                    "Dropping metric with bad quality"
                );
                continue;
            };
            if reading.quality == PointQuality::Bad {
                tracing::warn!(
                    device_id = %device.id,
                    metric = %def.name,
                    "Dropping metric with bad quality"
                );
                continue;
            }

            let mut value = value;
            if def.scale_factor != 1.0 {
                value = value.apply_scale(def.scale_factor);
            }
            let value = value.coerce(def.data_type);

            metrics.insert(
                def.name.clone(),
                MetricValue {
                    name: def.name.clone(),
                    value,
                    unit: def.unit.clone(),
                    quality: reading.quality,
                },
            );
            good += 1;
        }

        MetricData {
            device_id: device.id.clone(),
            device_ip: device.ip.clone(),
            timestamp: Utc::now(),
            metrics,
            tags: device.tags.clone(),
            quality: Quality::aggregate(good, device.metrics.len()),
        }
    }
}

#[async_trait]
impl Protocol for SessionProtocol {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn collect(&self, device: &Device) -> Result<MetricData, ProtocolError> {
        if device.metrics.is_empty() {
            return Err(ProtocolError::NoNodes);
        }

        let started = Instant::now();
        let mut conn = self.pool.get(device, self.factory.as_ref()).await?;

        let node_ids: Vec<String> = device.metrics.iter().map(|m| m.node_id.clone()).collect();
        let outcome = conn.session_mut().read(&node_ids).await;
        self.pool.put(conn).await;

        let readings = outcome?;
        let data = self.assemble(device, readings);

        tracing::debug!(
            device_id = %device.id,
            metrics = data.metrics.len(),
            quality = %data.quality,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Collected metrics"
        );
        Ok(data)
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        self.pool.close().await;
        Ok(())
    }
}
