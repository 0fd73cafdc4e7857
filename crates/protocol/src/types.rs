//! Core types shared across the protocol

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pairing lifecycle status of a gateway instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Disconnected,
    Provisioning,
    WaitingForScan,
    Connected,
    Failed,
}

impl PairingStatus {
    /// Monotonic rank used to reconcile concurrent observers.
    ///
    /// `Disconnected < Provisioning < WaitingForScan < Connected`; `Failed` is
    /// terminal and outranks every other status.
    pub fn rank(self) -> u8 {
        match self {
            PairingStatus::Disconnected => 0,
            PairingStatus::Provisioning => 1,
            PairingStatus::WaitingForScan => 2,
            PairingStatus::Connected => 3,
            PairingStatus::Failed => u8::MAX,
        }
    }

    /// Whether the session currently holds (or is acquiring) a gateway instance.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            PairingStatus::Provisioning | PairingStatus::WaitingForScan | PairingStatus::Connected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PairingStatus::Disconnected => "disconnected",
            PairingStatus::Provisioning => "provisioning",
            PairingStatus::WaitingForScan => "waiting_for_scan",
            PairingStatus::Connected => "connected",
            PairingStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "disconnected" => Some(PairingStatus::Disconnected),
            "provisioning" => Some(PairingStatus::Provisioning),
            "waiting_for_scan" => Some(PairingStatus::WaitingForScan),
            "connected" => Some(PairingStatus::Connected),
            "failed" => Some(PairingStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state as reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Open,
    Close,
    Connecting,
}

impl ConnState {
    /// Parse the loosely-typed state strings the gateway emits.
    pub fn from_gateway(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" | "connected" => Some(ConnState::Open),
            "close" | "closed" | "disconnected" => Some(ConnState::Close),
            "connecting" => Some(ConnState::Connecting),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::Open => "open",
            ConnState::Close => "close",
            ConnState::Connecting => "connecting",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable error categories surfaced to callers and stored on sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigMissing,
    PhoneNumberMissing,
    TenantNotFound,
    ProvisionFailed,
    GatewayUnreachable,
    PairingTimeout,
    InvalidWebhookPayload,
    DisconnectFailed,
    SessionNotFound,
    NotWaitingForScan,
    InvalidRequest,
    Unauthorized,
    Internal,
}

/// Error descriptor recorded on a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Local record of one gateway instance's pairing lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingSession {
    pub id: String,
    pub tenant_id: String,
    pub instance_name: String,
    pub status: PairingStatus,
    /// Base64 image or raw pairing code; only present while waiting for a scan.
    pub qr_payload: Option<String>,
    pub qr_issued_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub last_error: Option<SessionError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PairingSession {
    /// A fresh session row in `Disconnected`, ready for its first pairing request.
    pub fn new(tenant_id: &str, instance_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: crate::new_id(),
            tenant_id: tenant_id.to_string(),
            instance_name: instance_name.to_string(),
            status: PairingStatus::Disconnected,
            qr_payload: None,
            qr_issued_at: None,
            connected_at: None,
            last_activity_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.tenant_id, &self.instance_name)
    }
}

/// Identity of a session: at most one row per (tenant, instance)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub tenant_id: String,
    pub instance_name: String,
}

impl SessionKey {
    pub fn new(tenant_id: &str, instance_name: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            instance_name: instance_name.to_string(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.instance_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_orders_non_terminal_statuses() {
        assert!(PairingStatus::Disconnected.rank() < PairingStatus::Provisioning.rank());
        assert!(PairingStatus::Provisioning.rank() < PairingStatus::WaitingForScan.rank());
        assert!(PairingStatus::WaitingForScan.rank() < PairingStatus::Connected.rank());
        assert!(PairingStatus::Failed.rank() > PairingStatus::Connected.rank());
    }

    #[test]
    fn status_string_round_trips_through_parse() {
        for status in [
            PairingStatus::Disconnected,
            PairingStatus::Provisioning,
            PairingStatus::WaitingForScan,
            PairingStatus::Connected,
            PairingStatus::Failed,
        ] {
            assert_eq!(PairingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PairingStatus::parse("testing"), None);
    }

    #[test]
    fn gateway_state_strings_are_normalized() {
        assert_eq!(ConnState::from_gateway("open"), Some(ConnState::Open));
        assert_eq!(ConnState::from_gateway(" OPEN "), Some(ConnState::Open));
        assert_eq!(ConnState::from_gateway("close"), Some(ConnState::Close));
        assert_eq!(
            ConnState::from_gateway("connecting"),
            Some(ConnState::Connecting)
        );
        assert_eq!(ConnState::from_gateway("banana"), None);
    }

    #[test]
    fn session_serializes_status_as_snake_case() {
        let session = PairingSession::new("t1", "acme-20260101", Utc::now());
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["status"], "disconnected");
        assert_eq!(json["tenant_id"], "t1");
    }
}
