//! HTTP exporter for a controller's metrics.
//!
//! Routes:
//! - `GET /metrics`: Prometheus text format
//! - `GET /snapshot`: the same counters as JSON
//! - `GET /health`: 200 while the session is streaming or closed, 503 while
//!   it is in a transitional phase

use crate::metrics::{MetricsSnapshot, SessionMetrics};
use crate::session::SessionPhase;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::CorsLayer;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Errors from running the exporter.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind metrics listener: {0}")]
    Bind(#[from] std::io::Error),

    /// The server stopped with an error.
    #[error("metrics server failed: {0}")]
    Server(String),
}

/// Where the exporter listens.
#[derive(Debug, Clone)]
pub struct MetricsServerConfig {
    /// Listen address.
    pub bind_addr: SocketAddr,
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self::with_port(9090)
    }
}

impl MetricsServerConfig {
    /// Listens on every interface at `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
        }
    }
}

/// Serves one [`SessionMetrics`] registry over HTTP.
pub struct MetricsServer {
    config: MetricsServerConfig,
    metrics: Arc<SessionMetrics>,
}

impl MetricsServer {
    /// Builds an exporter for `metrics`.
    pub fn new(config: MetricsServerConfig, metrics: Arc<SessionMetrics>) -> Self {
        Self { config, metrics }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(prometheus_text))
            .route("/snapshot", get(snapshot_json))
            .route("/health", get(session_health))
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&self.metrics))
    }

    /// Serves until the process exits.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` resolves, then finishes in-flight requests.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!(addr = %self.config.bind_addr, "metrics exporter listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Server(e.to_string()))
    }
}

async fn prometheus_text(State(metrics): State<Arc<SessionMetrics>>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            format!("encode failed: {}", e),
        ),
    }
}

async fn snapshot_json(State(metrics): State<Arc<SessionMetrics>>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}

fn health_status(phase: i64) -> StatusCode {
    let settled = phase == SessionPhase::Streaming.code() || phase == SessionPhase::Closed.code();
    if settled {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn session_health(State(metrics): State<Arc<SessionMetrics>>) -> impl IntoResponse {
    let phase = metrics.snapshot().phase;
    (health_status(phase), format!("phase={}", phase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_ports() {
        assert_eq!(MetricsServerConfig::default().bind_addr.port(), 9090);
        assert_eq!(MetricsServerConfig::with_port(8080).bind_addr.port(), 8080);
    }

    #[test]
    fn test_health_follows_phase() {
        assert_eq!(health_status(SessionPhase::Streaming.code()), StatusCode::OK);
        assert_eq!(health_status(SessionPhase::Closed.code()), StatusCode::OK);
        assert_eq!(
            health_status(SessionPhase::Configuring.code()),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_metrics_route_encodes_registry() {
        let metrics = Arc::new(SessionMetrics::new().unwrap());
        metrics.record_open_attempt();
        let response = prometheus_text(State(metrics)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
