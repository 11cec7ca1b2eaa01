//! Admin HTTP endpoint
//!
//! - `GET /metrics`: Prometheus text format
//! - `GET /healthz`: liveness of the agent itself
//! - `GET /debug/egress`: JSON snapshot of the egress index

use crate::apis::metrics::gather_metrics;
use crate::egress::{EgressIpWatcher, EgressSnapshot};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

type AdminResponse = Response<Full<Bytes>>;

/// Accept connections until the task is aborted
pub async fn serve_admin(
    listener: TcpListener,
    egress: Arc<EgressIpWatcher>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!(addr = %listener.local_addr()?, "Admin endpoint listening");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Failed to accept admin connection: {}", e);
                continue;
            }
        };
        debug!("Accepted admin connection from {}", peer_addr);

        let egress = egress.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req: Request<Incoming>| {
                let egress = egress.clone();
                async move { handle_request(req, egress).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Admin connection error: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    egress: Arc<EgressIpWatcher>,
) -> Result<AdminResponse, Infallible> {
    if req.method() != Method::GET {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed\n",
        ));
    }

    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" => text_response(StatusCode::OK, "ok\n"),
        "/debug/egress" => {
            // The index lock can be held across host commands
            match tokio::task::spawn_blocking(move || egress.snapshot()).await {
                Ok(snapshot) => snapshot_response(&snapshot),
                Err(e) => text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("snapshot failed: {}\n", e),
                ),
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found\n"),
    };
    Ok(response)
}

fn metrics_response() -> AdminResponse {
    match gather_metrics() {
        Ok(text) => with_body(StatusCode::OK, "text/plain; version=0.0.4", text),
        Err(e) => {
            error!("{}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

fn snapshot_response(snapshot: &EgressSnapshot) -> AdminResponse {
    match serde_json::to_string_pretty(snapshot) {
        Ok(json) => with_body(StatusCode::OK, "application/json", json),
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode snapshot: {}\n", e),
        ),
    }
}

fn text_response(status: StatusCode, body: impl Into<String>) -> AdminResponse {
    with_body(status, "text/plain; charset=utf-8", body.into())
}

fn with_body(status: StatusCode, content_type: &'static str, body: String) -> AdminResponse {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = hyper::header::HeaderValue::from_str(content_type) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}
