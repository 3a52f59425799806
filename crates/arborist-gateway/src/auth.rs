use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::{Arc, RwLock};
use subtle::ConstantTimeEq;

/// Bearer token authentication state. The token lives behind a lock rather
/// than as a plain field so a config hot-reload can swap it without
/// tearing down the listener or any open WebSocket connection.
#[derive(Clone)]
pub struct AuthConfig {
    api_token: Arc<RwLock<Option<String>>>,
}

impl AuthConfig {
    pub fn new(api_token: Option<String>) -> Self {
        Self { api_token: Arc::new(RwLock::new(api_token)) }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_token.read().unwrap().is_some()
    }

    fn token(&self) -> Option<String> {
        self.api_token.read().unwrap().clone()
    }

    /// Install a new bearer token (or disable auth entirely with `None`),
    /// applied to every request from this point on.
    pub fn set_token(&self, api_token: Option<String>) {
        *self.api_token.write().unwrap() = api_token;
    }
}

/// Authentication middleware for API endpoints
pub async fn auth_middleware(
    auth_config: Arc<AuthConfig>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();

    // Skip auth for health endpoint
    if path == "/health" {
        return next.run(request).await;
    }

    // If auth is disabled, proceed
    if !auth_config.is_enabled() {
        return next.run(request).await;
    }

    // Extract Authorization header
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok());

    match auth_header {
        Some(header) if header.starts_with("Bearer ") => {
            let token = &header[7..];
            if let Some(expected_token) = auth_config.token() {
                if token.as_bytes().ct_eq(expected_token.as_bytes()).into() {
                    return next.run(request).await;
                }
            }
        }
        _ => {}
    }

    // Unauthorized
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}
