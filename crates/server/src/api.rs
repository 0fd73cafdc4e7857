//! HTTP API: pairing operations, status reads, and the gateway webhook.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use pairline_protocol::{ErrorBody, ErrorDetail, PairingSession, StartPairingRequest};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::auth_middleware;
use crate::error::PairingError;
use crate::state::AppState;
use crate::websocket::ws_handler;

pub fn router(state: Arc<AppState>, auth_token: Option<String>) -> Router {
    let mut protected = Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/tenants/{tenant_id}/pairing", post(start_pairing))
        .route(
            "/api/tenants/{tenant_id}/pairing/{instance}",
            get(get_session).delete(disconnect),
        )
        .route(
            "/api/tenants/{tenant_id}/pairing/{instance}/qr",
            post(refresh_qr),
        )
        .route(
            "/api/tenants/{tenant_id}/pairing/{instance}/record",
            delete(remove_session),
        )
        .route("/ws", get(ws_handler));

    if let Some(token) = auth_token {
        protected = protected.route_layer(middleware::from_fn_with_state(
            Arc::<str>::from(token),
            auth_middleware,
        ));
    }

    Router::new()
        .merge(protected)
        .route("/webhook/gateway", post(webhook))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

impl PairingError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PairingError::ConfigMissing(_) | PairingError::PhoneNumberMissing { .. } => {
                StatusCode::PRECONDITION_FAILED
            }
            PairingError::TenantNotFound { .. } | PairingError::SessionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            PairingError::ProvisionFailed { .. } | PairingError::DisconnectFailed(_) => {
                StatusCode::BAD_GATEWAY
            }
            PairingError::GatewayUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PairingError::PairingTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PairingError::InvalidWebhookPayload(_) | PairingError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            PairingError::NotWaitingForScan { .. } => StatusCode::CONFLICT,
            PairingError::Store(_) | PairingError::ActorUnavailable => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn into_response_with(self, session: Option<PairingSession>) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(
                component = "api",
                event = "api.request_failed",
                status = status.as_u16(),
                error = %self,
                "Request failed"
            );
        }
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind(),
                message: self.to_string(),
            },
            session,
        };
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for PairingError {
    fn into_response(self) -> Response {
        self.into_response_with(None)
    }
}

type ApiResult<T> = Result<T, PairingError>;

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<PairingSession>>> {
    Ok(Json(state.manager.list().await?))
}

/// An empty body means "derive the instance name".
async fn start_pairing(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<PairingSession>> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        StartPairingRequest::default()
    } else {
        serde_json::from_slice::<StartPairingRequest>(&body)
            .map_err(|e| PairingError::InvalidRequest(e.to_string()))?
    };
    let session = state
        .manager
        .start_pairing(&tenant_id, request.instance_name)
        .await?;
    Ok(Json(session))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, instance)): Path<(String, String)>,
) -> ApiResult<Json<PairingSession>> {
    Ok(Json(state.manager.session(&tenant_id, &instance).await?))
}

async fn refresh_qr(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, instance)): Path<(String, String)>,
) -> ApiResult<Json<PairingSession>> {
    Ok(Json(state.manager.refresh_qr(&tenant_id, &instance).await?))
}

/// A failed gateway logout still resets the session; the error body carries it.
async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, instance)): Path<(String, String)>,
) -> Response {
    match state.manager.disconnect(&tenant_id, &instance).await {
        Ok(session) => Json(session).into_response(),
        Err(err @ PairingError::DisconnectFailed(_)) => {
            let session = state.manager.session(&tenant_id, &instance).await.ok();
            err.into_response_with(session)
        }
        Err(err) => err.into_response(),
    }
}

async fn remove_session(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, instance)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.manager.remove(&tenant_id, &instance).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct WebhookQuery {
    token: Option<String>,
}

async fn webhook(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> Response {
    if let Some(expected) = &state.webhook_token {
        if query.token.as_deref() != Some(expected.as_str()) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    match state.ingester.ingest(&body).await {
        Ok(_) => StatusCode::ACCEPTED.into_response(),
        Err(e) => e.into_response(),
    }
}
