//! Status endpoints
//!
//! - `/health`, `/healthz`: liveness, always 200 while the process runs
//! - `/ready`, `/readyz`: 200 only when every client is READY
//! - `/health/wa`: readiness summary for all clients
//! - `/health/wa/{clientId}`: summary for one client
//!
//! Uses hyper http1 with TokioIo; one spawned task per connection.

use bytes::Bytes;
use chrono::Utc;
use http_body_util::Full;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::gateway::{GatewayFacade, GatewaySummary};
use crate::types::{GatewayError, Result};

/// Shared state for the status server
pub struct StatusState {
    pub gateway: Arc<GatewayFacade>,
    pub started_at: Instant,
    /// Clients were registered without connecting
    pub skip_init: bool,
}

impl StatusState {
    pub fn new(gateway: Arc<GatewayFacade>, skip_init: bool) -> Self {
        Self {
            gateway,
            started_at: Instant::now(),
            skip_init,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LivenessResponse {
    status: &'static str,
    healthy: bool,
    mode: &'static str,
    version: &'static str,
    uptime: u64,
    timestamp: String,
    ready: bool,
    skip_init: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GatewayHealthResponse {
    status: &'static str,
    skip_init: bool,
    #[serde(flatten)]
    summary: GatewaySummary,
}

/// Serve the status endpoints until the listener fails
pub async fn run(listen: SocketAddr, state: Arc<StatusState>) -> Result<()> {
    let listener = TcpListener::bind(listen).await.map_err(|e| {
        GatewayError::Config(format!("cannot bind status listener on {}: {}", listen, e))
    })?;
    info!("Status server listening on {}", listen);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move {
                            debug!("[{}] {} {}", addr, req.method(), req.uri().path());
                            Ok::<_, Infallible>(route(&state, req.method(), req.uri().path()))
                        }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route one request
pub fn route(state: &StatusState, method: &Method, path: &str) -> Response<Full<Bytes>> {
    if *method != Method::GET {
        return json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &serde_json::json!({ "error": "Method Not Allowed", "path": path }),
        );
    }

    match path.trim_end_matches('/') {
        "/health" | "/healthz" => json_response(StatusCode::OK, &liveness(state)),
        "/ready" | "/readyz" => {
            let summary = state.gateway.readiness_summary();
            let status = if summary.ready || state.skip_init {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(status, &summary)
        }
        "/health/wa" => json_response(
            StatusCode::OK,
            &GatewayHealthResponse {
                status: "ok",
                skip_init: state.skip_init,
                summary: state.gateway.readiness_summary(),
            },
        ),
        p => match p.strip_prefix("/health/wa/") {
            Some(client_id) if !client_id.is_empty() => match state.gateway.client(client_id) {
                Ok(client) => json_response(StatusCode::OK, &client.readiness_summary()),
                Err(e) => error_response(&e),
            },
            _ => json_response(
                StatusCode::NOT_FOUND,
                &serde_json::json!({ "error": "Not Found", "path": path }),
            ),
        },
    }
}

fn liveness(state: &StatusState) -> LivenessResponse {
    LivenessResponse {
        status: "ok",
        healthy: true,
        mode: "send-only",
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: Utc::now().to_rfc3339(),
        ready: state.gateway.readiness_summary().ready,
        skip_init: state.skip_init,
    }
}

fn error_response(err: &GatewayError) -> Response<Full<Bytes>> {
    json_response(
        err.status_code(),
        &serde_json::json!({ "error": err.to_string() }),
    )
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_string(body)
        .unwrap_or_else(|_| r#"{"error":"Serialization failed"}"#.to_string());
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}
