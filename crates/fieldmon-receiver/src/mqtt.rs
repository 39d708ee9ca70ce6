use crate::{MqttReceiverConfig, PushHandler, ReceiverAdapter};
use async_trait::async_trait;
use fieldmon_common::MetricData;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// MQTT ingress: subscribes to the configured topics and feeds decoded
/// payloads into the push handler. The event loop reconnects on poll errors
/// with a short delay and re-subscribes on every connect acknowledgement.
pub struct MqttReceiver {
    cfg: MqttReceiverConfig,
    handler: PushHandler,
    cancel: CancellationToken,
    received: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    client: parking_lot::Mutex<Option<AsyncClient>>,
    event_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MqttReceiver {
    pub fn new(cfg: MqttReceiverConfig, handler: PushHandler, cancel: CancellationToken) -> Self {
        Self {
            cfg,
            handler,
            cancel,
            received: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            client: parking_lot::Mutex::new(None),
            event_loop: parking_lot::Mutex::new(None),
        }
    }

    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

fn handle_payload(
    payload: &[u8],
    topic: &str,
    handler: &PushHandler,
    received: &AtomicU64,
    errors: &AtomicU64,
) {
    let data: MetricData = match serde_json::from_slice(payload) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!(topic = %topic, error = %e, "Failed to decode MQTT payload");
            errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    if data.device_id.is_empty() {
        tracing::warn!(topic = %topic, "Received MQTT message without device_id");
        errors.fetch_add(1, Ordering::Relaxed);
        return;
    }

    tracing::debug!(
        device_id = %data.device_id,
        topic = %topic,
        metric_count = data.metrics.len(),
        "Processing MQTT metric data"
    );

    match handler(data) {
        Ok(()) => {
            received.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            tracing::error!(topic = %topic, error = %e, "Failed to handle MQTT data");
            errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl ReceiverAdapter for MqttReceiver {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let client_id = if self.cfg.client_id.is_empty() {
            format!("fieldmon-receiver-{}", std::process::id())
        } else {
            self.cfg.client_id.clone()
        };

        let mut options = MqttOptions::new(client_id, &self.cfg.broker_host, self.cfg.broker_port);
        options.set_keep_alive(Duration::from_secs(self.cfg.keep_alive.max(5)));
        if !self.cfg.username.is_empty() {
            options.set_credentials(&self.cfg.username, &self.cfg.password);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        for topic in &self.cfg.topics {
            client.subscribe(topic.as_str(), QoS::AtLeastOnce).await?;
            tracing::info!(topic = %topic, "Subscribed to topic");
        }
        *self.client.lock() = Some(client.clone());

        tracing::info!(
            broker = %format!("{}:{}", self.cfg.broker_host, self.cfg.broker_port),
            topics = ?self.cfg.topics,
            "MQTT receiver connecting"
        );

        let handler = self.handler.clone();
        let received = self.received.clone();
        let errors = self.errors.clone();
        let topics = self.cfg.topics.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            tracing::info!("MQTT receiver connected");
                            for topic in &topics {
                                if let Err(e) = client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                                    tracing::error!(topic = %topic, error = %e, "Failed to subscribe");
                                }
                            }
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            handle_payload(
                                &publish.payload,
                                &publish.topic,
                                &handler,
                                &received,
                                &errors,
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "MQTT connection error, retrying");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        });
        *self.event_loop.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        let client = self.client.lock().take();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!("MQTT receiver stopped");
    }
}
