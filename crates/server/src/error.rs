//! Error taxonomy for the pairing lifecycle.

use chrono::{DateTime, Utc};
use pairline_gateway::GatewayError;
use pairline_protocol::{ErrorKind, PairingStatus, SessionError};
use thiserror::Error;

use crate::persistence::StoreError;

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("Gateway configuration missing: {0}")]
    ConfigMissing(String),

    #[error("Tenant {tenant_id} has no phone number configured")]
    PhoneNumberMissing { tenant_id: String },

    #[error("Tenant {tenant_id} not found")]
    TenantNotFound { tenant_id: String },

    #[error("Gateway rejected provisioning (status {status:?}): {body}")]
    ProvisionFailed { status: Option<u16>, body: String },

    #[error("Gateway unreachable: {0}")]
    GatewayUnreachable(String),

    #[error("No device linked within {budget_secs}s")]
    PairingTimeout { budget_secs: u64 },

    #[error("Invalid webhook payload: {0}")]
    InvalidWebhookPayload(String),

    #[error("Gateway logout failed: {0}")]
    DisconnectFailed(String),

    #[error("No pairing session for {0}")]
    SessionNotFound(String),

    #[error("Session {key} is {status}, not waiting for a scan")]
    NotWaitingForScan { key: String, status: PairingStatus },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Session actor unavailable")]
    ActorUnavailable,
}

impl PairingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PairingError::ConfigMissing(_) => ErrorKind::ConfigMissing,
            PairingError::PhoneNumberMissing { .. } => ErrorKind::PhoneNumberMissing,
            PairingError::TenantNotFound { .. } => ErrorKind::TenantNotFound,
            PairingError::ProvisionFailed { .. } => ErrorKind::ProvisionFailed,
            PairingError::GatewayUnreachable(_) => ErrorKind::GatewayUnreachable,
            PairingError::PairingTimeout { .. } => ErrorKind::PairingTimeout,
            PairingError::InvalidWebhookPayload(_) => ErrorKind::InvalidWebhookPayload,
            PairingError::DisconnectFailed(_) => ErrorKind::DisconnectFailed,
            PairingError::SessionNotFound(_) => ErrorKind::SessionNotFound,
            PairingError::NotWaitingForScan { .. } => ErrorKind::NotWaitingForScan,
            PairingError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            PairingError::Store(_) | PairingError::ActorUnavailable => ErrorKind::Internal,
        }
    }

    /// Descriptor stored in a session's `last_error`.
    pub fn to_session_error(&self, at: DateTime<Utc>) -> SessionError {
        SessionError {
            kind: self.kind(),
            message: self.to_string(),
            at,
        }
    }

    /// Classify a failed create/connect call. Transport failures stay
    /// distinguishable from gateway rejections.
    pub fn from_provisioning(err: GatewayError) -> Self {
        if err.is_transport() {
            return PairingError::GatewayUnreachable(err.to_string());
        }
        match err {
            GatewayError::Rejected { status, body } => PairingError::ProvisionFailed {
                status: Some(status),
                body,
            },
            other => PairingError::ProvisionFailed {
                status: None,
                body: other.to_string(),
            },
        }
    }
}
