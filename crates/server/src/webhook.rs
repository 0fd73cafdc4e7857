//! Gateway webhook ingestion.
//!
//! Turns the gateway's loosely shaped push notifications into session events
//! and hands them to the owning session actor. A bad payload is rejected
//! without touching any session.

use std::sync::Arc;

use pairline_protocol::ConnState;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::PairingError;
use crate::manager::PairingSessionManager;

/// A webhook payload after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    ConnectionUpdate {
        instance_name: String,
        state: ConnState,
    },
    /// The device or gateway refused the link.
    ConnectionRefused {
        instance_name: String,
        reason: String,
    },
    QrCodeUpdated {
        instance_name: String,
        qr_payload: String,
    },
    /// Well-formed but not a pairing concern (messages, presence, ...).
    Ignored {
        instance_name: String,
        event: String,
    },
}

impl WebhookEvent {
    pub fn instance_name(&self) -> &str {
        match self {
            WebhookEvent::ConnectionUpdate { instance_name, .. }
            | WebhookEvent::ConnectionRefused { instance_name, .. }
            | WebhookEvent::QrCodeUpdated { instance_name, .. }
            | WebhookEvent::Ignored { instance_name, .. } => instance_name,
        }
    }
}

/// `connection.update` and `CONNECTION_UPDATE` name the same event.
fn normalize_event_name(raw: &str) -> String {
    raw.trim().replace(['.', '-'], "_").to_ascii_uppercase()
}

fn invalid(message: impl Into<String>) -> PairingError {
    PairingError::InvalidWebhookPayload(message.into())
}

pub fn parse_event(raw: &[u8]) -> Result<WebhookEvent, PairingError> {
    let payload: Value =
        serde_json::from_slice(raw).map_err(|e| invalid(format!("body is not JSON: {}", e)))?;
    if !payload.is_object() {
        return Err(invalid("body must be a JSON object"));
    }

    let instance_name = payload["instanceName"]
        .as_str()
        .or_else(|| payload["instance"].as_str())
        .or_else(|| payload["instance"]["instanceName"].as_str())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| invalid("missing instance name"))?
        .to_string();

    let event = payload["event"]
        .as_str()
        .map(normalize_event_name)
        .filter(|event| !event.is_empty())
        .ok_or_else(|| invalid("missing event"))?;

    let data = &payload["data"];
    if !data.is_object() {
        return Err(invalid("missing data object"));
    }

    if let Some(sent_at) = payload["date_time"].as_str() {
        debug!(
            component = "webhook",
            event = "webhook.received",
            instance = %instance_name,
            gateway_event = %event,
            sent_at = %sent_at,
            "Webhook received"
        );
    }

    match event.as_str() {
        "CONNECTION_UPDATE" => {
            let raw_state = data["state"]
                .as_str()
                .or_else(|| data["status"].as_str())
                .or_else(|| data["connection"].as_str())
                .ok_or_else(|| invalid("connection update without state"))?;

            if raw_state.trim().eq_ignore_ascii_case("refused") {
                let reason = data["statusReason"]
                    .as_i64()
                    .map(|code| format!("gateway refused the connection (reason {})", code))
                    .unwrap_or_else(|| "gateway refused the connection".to_string());
                return Ok(WebhookEvent::ConnectionRefused {
                    instance_name,
                    reason,
                });
            }

            let state = ConnState::from_gateway(raw_state)
                .ok_or_else(|| invalid(format!("unknown connection state {:?}", raw_state)))?;
            Ok(WebhookEvent::ConnectionUpdate {
                instance_name,
                state,
            })
        }
        "QRCODE_UPDATED" => {
            let qr_payload = data["qrcode"]["base64"]
                .as_str()
                .or_else(|| data["qrcode"]["code"].as_str())
                .or_else(|| data["qrcode"].as_str())
                .or_else(|| data["base64"].as_str())
                .filter(|qr| !qr.is_empty())
                .ok_or_else(|| invalid("QR update without a payload"))?
                .to_string();
            Ok(WebhookEvent::QrCodeUpdated {
                instance_name,
                qr_payload,
            })
        }
        _ => Ok(WebhookEvent::Ignored {
            instance_name,
            event,
        }),
    }
}

pub struct WebhookEventIngester {
    manager: Arc<PairingSessionManager>,
    clock: Clock,
}

impl WebhookEventIngester {
    pub fn new(manager: Arc<PairingSessionManager>, clock: Clock) -> Self {
        Self { manager, clock }
    }

    /// Validate a raw payload and forward it to the owning session.
    ///
    /// Returns `InvalidWebhookPayload` for malformed bodies and
    /// `SessionNotFound` when no session owns the instance.
    pub async fn ingest(&self, raw: &[u8]) -> Result<WebhookEvent, PairingError> {
        let event = match parse_event(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    component = "webhook",
                    event = "webhook.invalid",
                    error = %e,
                    "Dropping malformed webhook"
                );
                return Err(e);
            }
        };
        let observed_at = self.clock.now();

        let delivered = match &event {
            WebhookEvent::ConnectionUpdate {
                instance_name,
                state,
            } => {
                self.manager
                    .observe_connection(instance_name, *state, observed_at)
                    .await
            }
            WebhookEvent::ConnectionRefused {
                instance_name,
                reason,
            } => {
                self.manager
                    .reject_pairing(instance_name, reason.clone())
                    .await
            }
            WebhookEvent::QrCodeUpdated {
                instance_name,
                qr_payload,
            } => self.manager.push_qr(instance_name, qr_payload.clone()).await,
            WebhookEvent::Ignored { .. } => Ok(()),
        };

        match &delivered {
            Ok(()) => info!(
                component = "webhook",
                event = "webhook.accepted",
                instance = %event.instance_name(),
                kind = ?event,
                "Webhook accepted"
            ),
            Err(e) => warn!(
                component = "webhook",
                event = "webhook.undeliverable",
                instance = %event.instance_name(),
                error = %e,
                "Webhook could not be delivered"
            ),
        }
        delivered.map(|()| event)
    }
}
