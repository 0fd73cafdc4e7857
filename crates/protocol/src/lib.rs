//! Pairline Protocol
//!
//! Shared types for the pairing session lifecycle.
//! These types are serialized as JSON over HTTP and WebSocket.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod server;
pub mod types;

pub use client::{ErrorBody, ErrorDetail, StartPairingRequest};
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
