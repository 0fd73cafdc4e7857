//! Optional auth token middleware.
//!
//! When `--auth-token` is configured, all requests to `/api/*` and `/ws`
//! must include `Authorization: Bearer <token>` (or `?token=<token>` for
//! WebSocket). `/health` and the gateway webhook are routed outside it.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

/// Axum middleware that checks for a valid auth token.
pub async fn auth_middleware(
    State(expected_token): State<Arc<str>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(auth_header) = req.headers().get("authorization") {
        if let Ok(value) = auth_header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                if token == &*expected_token {
                    return Ok(next.run(req).await);
                }
            }
        }
    }

    if query_token(req.uri().query()).is_some_and(|token| token == &*expected_token) {
        return Ok(next.run(req).await);
    }

    Err(StatusCode::UNAUTHORIZED)
}

/// The `token` query parameter, if present.
pub fn query_token(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
}
