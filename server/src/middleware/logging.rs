//! Request logging middleware: logs method, path, status, and latency
//! for every request.

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

pub async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let content_type = request
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none")
        .to_string();

    tracing::debug!(%method, %uri, content_type, "incoming request");

    let response = next.run(request).await;

    tracing::debug!(%method, %uri, status = %response.status(), "request completed");

    response
}
