//! HTTP middleware: CORS, request size limits and request logging.

use axum::{
    extract::Request,
    http::{HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
};
use tracing::{info, warn};

use crate::settings::ServerConfig;

/// Create CORS layer from server configuration
pub fn create_cors_layer(config: &ServerConfig) -> CorsLayer {
    if !config.enable_cors {
        // Same-origin only
        return CorsLayer::new();
    }

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([axum::http::header::CONTENT_TYPE, axum::http::header::ACCEPT]);

    if config.cors_origins.iter().any(|origin| origin == "*") {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(origins)
}

/// Create request body size limit layer
pub fn create_body_limit_layer(max_size_kb: usize) -> RequestBodyLimitLayer {
    RequestBodyLimitLayer::new(max_size_kb * 1024)
}

/// Log every request with its status and latency
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    if status.is_server_error() || status.is_client_error() {
        warn!(%method, %path, status = status.as_u16(), elapsed_ms, "Request failed");
    } else {
        info!(%method, %path, status = status.as_u16(), elapsed_ms, "Request handled");
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::post, Router};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_body_limit_rejects_large_payloads() {
        let app = Router::new()
            .route("/echo", post(|body: String| async move { body }))
            .layer(create_body_limit_layer(1));

        let request = axum::http::Request::post("/echo")
            .body(Body::from(vec![b'x'; 2048]))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin() {
        let config = ServerConfig {
            cors_origins: vec!["https://example.com".to_string()],
            ..ServerConfig::default()
        };
        let app = Router::new()
            .route("/echo", post(|| async { "ok" }))
            .layer(create_cors_layer(&config));

        let request = axum::http::Request::post("/echo")
            .header("origin", "https://example.com")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "https://example.com"
        );
    }
}
