//! Metrics middleware for request tracking
//!
//! Records per-route status classes and latency, and writes one access log
//! line per request at a level matching the status.

use axum::{
    body::Body,
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use welcomer_common::{ImageMetrics, Route};

/// Map a request onto the route it is counted under
fn extract_route(method: &Method, path: &str) -> Option<Route> {
    let segments: Vec<&str> = path
        .trim_start_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (method, segments.as_slice()) {
        (_, ["metrics" | "health"]) => None,
        (m, ["images", _id]) if m == Method::GET => Some(Route::ImagesGet),
        (m, ["images"]) if m == Method::POST => Some(Route::ImagesCreate),
        _ => Some(Route::Other),
    }
}

pub async fn metrics_layer(
    State(metrics): State<Arc<ImageMetrics>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let Some(route) = extract_route(&method, &path) else {
        return next.run(request).await;
    };

    let response = next.run(request).await;
    let status = response.status();
    let elapsed = start.elapsed();
    metrics.record_request(route, status.as_u16(), elapsed);

    let elapsed_ms = elapsed.as_millis();
    if status.is_server_error() {
        error!("{} {} {} {}ms", method, path, status.as_u16(), elapsed_ms);
    } else if status.is_client_error() {
        warn!("{} {} {} {}ms", method, path, status.as_u16(), elapsed_ms);
    } else {
        info!("{} {} {} {}ms", method, path, status.as_u16(), elapsed_ms);
    }

    response
}
