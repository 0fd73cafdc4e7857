//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::PairingSession;

/// Frames pushed to status displays over the WebSocket stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Full state sync
    SessionsList {
        sessions: Vec<PairingSession>,
    },

    // Incremental updates
    SessionUpdated {
        session: PairingSession,
    },
    SessionRemoved {
        tenant_id: String,
        instance_name: String,
    },
}
