//! Client → Server request bodies

use serde::{Deserialize, Serialize};

use crate::types::{ErrorKind, PairingSession};

/// Body of a pairing request. The instance name is derived from the tenant
/// when omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartPairingRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

/// Error envelope returned by the HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
    /// Current session state when the operation still changed it locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<PairingSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}
