//! Prometheus text exporter with `/metrics` and `/health` endpoints

use crate::{MetricsError, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Answers the `/health` endpoint
pub trait Readiness: Send + Sync {
    /// Whether the process should receive traffic
    fn is_ready(&self) -> bool;

    /// JSON document describing the current state
    fn describe(&self) -> String;
}

struct ServerState {
    registry: Registry,
    readiness: Option<Arc<dyn Readiness>>,
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Serves a metrics registry over HTTP
pub struct PrometheusExporter {
    state: Arc<ServerState>,
    bind_addr: SocketAddr,
    server: Option<RunningServer>,
}

impl PrometheusExporter {
    pub fn new(registry: Registry, bind_addr: SocketAddr) -> Self {
        Self {
            state: Arc::new(ServerState {
                registry,
                readiness: None,
            }),
            bind_addr,
            server: None,
        }
    }

    /// Parse the bind address from configuration
    pub fn from_bind_str(registry: Registry, bind: &str) -> Result<Self> {
        let bind_addr = bind
            .parse()
            .map_err(|e| MetricsError::Config(format!("invalid metrics bind {}: {}", bind, e)))?;
        Ok(Self::new(registry, bind_addr))
    }

    /// Report `source` on `/health` instead of a bare liveness answer
    pub fn with_readiness(mut self, source: Arc<dyn Readiness>) -> Self {
        self.state = Arc::new(ServerState {
            registry: self.state.registry.clone(),
            readiness: Some(source),
        });
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.state.registry
    }

    /// Bind and serve in a background task
    pub async fn start_server(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Err(MetricsError::Config("metrics server already started".to_string()));
        }

        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(Arc::clone(&self.state));

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                warn!(error = %e, "Metrics server failed");
            }
        });

        info!(addr = %local_addr, "Serving metrics");
        self.server = Some(RunningServer {
            local_addr,
            shutdown,
            handle,
        });
        Ok(())
    }

    /// Stop serving and wait for in-flight scrapes to finish
    pub async fn stop_server(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };
        let _ = server.shutdown.send(());
        if let Err(e) = server.handle.await {
            warn!(error = %e, "Metrics server task ended abnormally");
        }
        debug!(addr = %server.local_addr, "Metrics server stopped");
    }

    /// Render the registry in the text exposition format
    pub fn export_metrics(&self) -> Result<String> {
        encode(&self.state.registry)
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|server| server.local_addr)
    }

    pub fn metrics_url(&self) -> String {
        let addr = self.local_addr().unwrap_or(self.bind_addr);
        format!("http://{}/metrics", addr)
    }

    pub fn is_running(&self) -> bool {
        self.server.is_some()
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| MetricsError::Export(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| MetricsError::Export(e.to_string()))
}

async fn metrics_handler(State(state): State<Arc<ServerState>>) -> Response {
    match encode(&state.registry) {
        Ok(text) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], text).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> Response {
    let Some(readiness) = &state.readiness else {
        return (StatusCode::OK, "ok").into_response();
    };
    let status = if readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        readiness.describe(),
    )
        .into_response()
}
