//! Pairline Gateway
//!
//! Stateless client for the messaging gateway that owns device instances.
//! Every call takes the credentials and a deadline explicitly and carries no
//! session state, so callers may retry freely.

pub mod evolution;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use pairline_protocol::ConnState;
use thiserror::Error;

pub use evolution::EvolutionClient;

/// Events subscribed to when an instance is created.
pub const DEFAULT_EVENTS: &[&str] = &["QRCODE_UPDATED", "CONNECTION_UPDATE"];

/// Errors that can occur talking to the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Gateway unreachable: {0}")]
    Unreachable(String),

    #[error("Gateway rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Unexpected gateway response: {0}")]
    UnexpectedResponse(String),

    #[error("Invalid gateway base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Transport-level failure: the gateway never produced an answer.
    pub fn is_transport(&self) -> bool {
        matches!(self, GatewayError::Timeout(_) | GatewayError::Unreachable(_))
    }

    /// The gateway refused creation because the instance name or its token is taken.
    pub fn is_name_conflict(&self) -> bool {
        let GatewayError::Rejected { body, .. } = self else {
            return false;
        };
        let lower = body.to_lowercase();
        (lower.contains("instance") && (lower.contains("already") || lower.contains("exists")))
            || (lower.contains("token") && lower.contains("already"))
    }

    /// The gateway no longer knows the instance.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::Rejected { status: 404, .. })
    }
}

/// Deployment-wide gateway credentials
#[derive(Clone, PartialEq, Eq)]
pub struct GlobalGatewayConfig {
    pub base_url: String,
    pub master_api_key: String,
}

impl GlobalGatewayConfig {
    pub fn new(base_url: impl Into<String>, master_api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            master_api_key: master_api_key.into(),
        }
    }

    /// Both fields must be present for any gateway call.
    pub fn is_complete(&self) -> bool {
        !self.base_url.trim().is_empty() && !self.master_api_key.trim().is_empty()
    }
}

impl fmt::Debug for GlobalGatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalGatewayConfig")
            .field("base_url", &self.base_url)
            .field("master_api_key", &"<redacted>")
            .finish()
    }
}

/// Parameters for provisioning a new instance
#[derive(Debug, Clone)]
pub struct CreateInstance {
    pub instance_name: String,
    /// Passed through verbatim; the gateway owns any formatting.
    pub phone_number: String,
    pub webhook_url: Option<String>,
    pub events: Vec<String>,
}

/// A provisioned instance as echoed back by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    pub instance_name: String,
    pub status: Option<String>,
}

/// Result of a successful create call
#[derive(Debug, Clone)]
pub struct CreatedInstance {
    pub handle: InstanceHandle,
    /// Present when the gateway embedded the QR in the creation response.
    pub qr_payload: Option<String>,
}

/// The four instance operations the pairing manager depends on, plus deletion
/// for gateways that need a fresh instance per QR.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn create_instance(
        &self,
        cfg: &GlobalGatewayConfig,
        request: &CreateInstance,
        deadline: Duration,
    ) -> Result<CreatedInstance, GatewayError>;

    async fn connection_state(
        &self,
        cfg: &GlobalGatewayConfig,
        instance_name: &str,
        deadline: Duration,
    ) -> Result<ConnState, GatewayError>;

    async fn qr_code(
        &self,
        cfg: &GlobalGatewayConfig,
        instance_name: &str,
        deadline: Duration,
    ) -> Result<String, GatewayError>;

    /// Log the device out. Already-disconnected instances count as success.
    async fn disconnect(
        &self,
        cfg: &GlobalGatewayConfig,
        instance_name: &str,
        deadline: Duration,
    ) -> Result<(), GatewayError>;

    /// Remove the instance entirely. Missing instances count as success.
    async fn delete_instance(
        &self,
        cfg: &GlobalGatewayConfig,
        instance_name: &str,
        deadline: Duration,
    ) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_api_key() {
        let cfg = GlobalGatewayConfig::new("http://gw.local", "super-secret");
        let rendered = format!("{:?}", cfg);
        assert!(rendered.contains("http://gw.local"));
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn blank_fields_make_config_incomplete() {
        assert!(GlobalGatewayConfig::new("http://gw.local", "k").is_complete());
        assert!(!GlobalGatewayConfig::new("  ", "k").is_complete());
        assert!(!GlobalGatewayConfig::new("http://gw.local", "").is_complete());
    }

    #[test]
    fn only_timeouts_and_unreachable_are_transport_errors() {
        assert!(GatewayError::Timeout(Duration::from_secs(1)).is_transport());
        assert!(GatewayError::Unreachable("refused".into()).is_transport());
        assert!(!GatewayError::Rejected {
            status: 500,
            body: String::new()
        }
        .is_transport());
    }

    #[test]
    fn name_conflicts_are_recognised_from_the_body() {
        let conflict = GatewayError::Rejected {
            status: 403,
            body: r#"{"response":{"message":["This name \"acme\" is already in use."]},"error":"instance already exists"}"#.into(),
        };
        assert!(conflict.is_name_conflict());
        assert!(!GatewayError::Rejected {
            status: 403,
            body: "forbidden".into()
        }
        .is_name_conflict());
        assert!(GatewayError::Rejected {
            status: 404,
            body: String::new()
        }
        .is_not_found());
    }
}
