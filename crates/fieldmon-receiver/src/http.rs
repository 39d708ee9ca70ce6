use crate::{AuthConfig, HttpReceiverConfig, PushHandler, ReceiverAdapter};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fieldmon_common::MetricData;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct HttpState {
    handler: PushHandler,
    auth: AuthConfig,
    received: AtomicU64,
    errors: AtomicU64,
}

/// REST ingress for pushed metric data.
///
/// `POST <endpoint>` accepts one `MetricData`, `POST <endpoint>/batch` an
/// array. `GET /health` and `GET /stats` are liveness and counter documents.
pub struct HttpReceiver {
    cfg: HttpReceiverConfig,
    state: Arc<HttpState>,
    cancel: CancellationToken,
    server: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HttpReceiver {
    pub fn new(cfg: HttpReceiverConfig, handler: PushHandler, cancel: CancellationToken) -> Self {
        let state = Arc::new(HttpState {
            handler,
            auth: cfg.auth.clone(),
            received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        });
        Self {
            cfg,
            state,
            cancel,
            server: parking_lot::Mutex::new(None),
        }
    }

    pub fn router(&self) -> Router {
        build_router(&self.cfg.endpoint, self.state.clone())
    }
}

pub fn build_router(endpoint: &str, state: Arc<HttpState>) -> Router {
    Router::new()
        .route(endpoint, post(handle_single))
        .route(&format!("{endpoint}/batch"), post(handle_batch))
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

async fn require_auth(
    State(state): State<Arc<HttpState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let auth = &state.auth;
    if !auth.enabled {
        return next.run(req).await;
    }

    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let authorized = match auth.kind.as_str() {
        "bearer" => {
            let expected = format!("Bearer {}", auth.token);
            header_value == Some(expected.as_str())
        }
        "basic" => header_value
            .and_then(|v| v.strip_prefix("Basic "))
            .and_then(|encoded| BASE64.decode(encoded).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .map(|creds| creds == format!("{}:{}", auth.username, auth.password))
            .unwrap_or(false),
        other => {
            tracing::warn!(auth_type = %other, "Unknown receiver auth type, rejecting");
            false
        }
    };

    if authorized {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "message": "Unauthorized"})),
        )
            .into_response()
    }
}

fn validate(data: &mut MetricData) -> Result<(), &'static str> {
    if data.device_id.is_empty() {
        return Err("Missing device_id");
    }
    Ok(())
}

async fn handle_single(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    let mut data: MetricData = match serde_json::from_slice(&body) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!(error = %e, "Failed to decode pushed metric data");
            state.errors.fetch_add(1, Ordering::Relaxed);
            return bad_request("Invalid JSON format");
        }
    };

    if let Err(msg) = validate(&mut data) {
        tracing::warn!("Received push data without device_id");
        state.errors.fetch_add(1, Ordering::Relaxed);
        return bad_request(msg);
    }

    tracing::debug!(
        device_id = %data.device_id,
        metric_count = data.metrics.len(),
        "Received metric data"
    );

    if let Err(e) = (state.handler)(data) {
        tracing::error!(error = %e, "Failed to handle pushed metric data");
        state.errors.fetch_add(1, Ordering::Relaxed);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "message": "Failed to process data"})),
        )
            .into_response();
    }

    state.received.fetch_add(1, Ordering::Relaxed);
    (
        StatusCode::OK,
        Json(json!({"success": true, "message": "Data received successfully"})),
    )
        .into_response()
}

async fn handle_batch(State(state): State<Arc<HttpState>>, body: Bytes) -> Response {
    let batch: Vec<MetricData> = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => {
            tracing::error!(error = %e, "Failed to decode pushed batch");
            state.errors.fetch_add(1, Ordering::Relaxed);
            return bad_request("Invalid JSON format");
        }
    };

    tracing::debug!(count = batch.len(), "Received batch metric data");

    let total = batch.len();
    let mut success_count = 0usize;
    let mut failed_count = 0usize;

    for mut data in batch {
        if validate(&mut data).is_err() {
            failed_count += 1;
            continue;
        }
        match (state.handler)(data) {
            Ok(()) => success_count += 1,
            Err(e) => {
                tracing::error!(error = %e, "Failed to handle metric data in batch");
                failed_count += 1;
            }
        }
    }

    state
        .received
        .fetch_add(success_count as u64, Ordering::Relaxed);
    state.errors.fetch_add(failed_count as u64, Ordering::Relaxed);

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "total": total,
            "success_count": success_count,
            "failed_count": failed_count,
        })),
    )
        .into_response()
}

async fn handle_health() -> Response {
    (
        StatusCode::OK,
        Json(json!({"status": "healthy", "receiver": "http"})),
    )
        .into_response()
}

async fn handle_stats(State(state): State<Arc<HttpState>>) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "received_count": state.received.load(Ordering::Relaxed),
            "error_count": state.errors.load(Ordering::Relaxed),
        })),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "message": message})),
    )
        .into_response()
}

#[async_trait]
impl ReceiverAdapter for HttpReceiver {
    fn name(&self) -> &str {
        "http"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.cfg.listen_addr).await?;
        tracing::info!(
            address = %self.cfg.listen_addr,
            endpoint = %self.cfg.endpoint,
            "HTTP receiver listening"
        );

        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "HTTP receiver server error");
            }
        });
        *self.server.lock() = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        let handle = self.server.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!("HTTP receiver stopped");
    }
}
