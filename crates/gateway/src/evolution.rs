//! Evolution-style gateway client over HTTP.
//!
//! Endpoints:
//!   POST   {base}/instance/create
//!   GET    {base}/instance/connectionState/{instance}
//!   GET    {base}/instance/connect/{instance}
//!   DELETE {base}/instance/logout/{instance}
//!   DELETE {base}/instance/delete/{instance}
//!
//! All requests authenticate with the `apikey` header.

use std::time::Duration;

use async_trait::async_trait;
use pairline_protocol::ConnState;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    CreateInstance, CreatedInstance, GatewayClient, GatewayError, GlobalGatewayConfig,
    InstanceHandle,
};

const LOG_PREVIEW_CHARS: usize = 500;

/// Gateway client backed by a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct EvolutionClient {
    http: reqwest::Client,
}

impl EvolutionClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        deadline: Duration,
    ) -> Result<(u16, String), GatewayError> {
        let resp = request
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| transport_error(e, deadline))?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| transport_error(e, deadline))?;
        Ok((status, text))
    }
}

#[async_trait]
impl GatewayClient for EvolutionClient {
    async fn create_instance(
        &self,
        cfg: &GlobalGatewayConfig,
        request: &CreateInstance,
        deadline: Duration,
    ) -> Result<CreatedInstance, GatewayError> {
        let url = endpoint(cfg, &["instance", "create"])?;

        // A unique token per instance avoids "token already exists" collisions.
        let mut body = json!({
            "instanceName": request.instance_name,
            "token": instance_token(),
            "number": request.phone_number,
            "qrcode": true,
            "integration": "BAILEYS",
            "events": request.events,
        });
        if let Some(webhook_url) = &request.webhook_url {
            body["webhookUrl"] = json!(webhook_url);
        }

        info!(
            component = "gateway",
            event = "gateway.instance.create",
            instance = %request.instance_name,
            "Creating gateway instance"
        );

        let (status, text) = self
            .send(
                self.http
                    .post(url)
                    .header("apikey", &cfg.master_api_key)
                    .json(&body),
                deadline,
            )
            .await?;

        info!(
            component = "gateway",
            event = "gateway.instance.create.response",
            instance = %request.instance_name,
            status = status,
            body = %preview(&text),
            "Instance create response"
        );

        if !is_success(status) {
            return Err(GatewayError::Rejected { status, body: text });
        }

        let Ok(resp_json) = serde_json::from_str::<Value>(&text) else {
            return Err(GatewayError::Rejected { status, body: text });
        };

        // Success requires the gateway to echo the instance we asked for.
        let echoed = resp_json["instance"]["instanceName"].as_str();
        if echoed != Some(request.instance_name.as_str()) {
            warn!(
                component = "gateway",
                event = "gateway.instance.create.no_echo",
                instance = %request.instance_name,
                echoed = ?echoed,
                "Create response did not echo the instance name"
            );
            return Err(GatewayError::Rejected { status, body: text });
        }

        let handle = InstanceHandle {
            instance_name: request.instance_name.clone(),
            status: resp_json["instance"]["status"].as_str().map(str::to_string),
        };

        Ok(CreatedInstance {
            handle,
            qr_payload: extract_qr(&resp_json),
        })
    }

    async fn connection_state(
        &self,
        cfg: &GlobalGatewayConfig,
        instance_name: &str,
        deadline: Duration,
    ) -> Result<ConnState, GatewayError> {
        let url = endpoint(cfg, &["instance", "connectionState", instance_name])?;
        let (status, text) = self
            .send(
                self.http.get(url).header("apikey", &cfg.master_api_key),
                deadline,
            )
            .await?;

        if !is_success(status) {
            return Err(GatewayError::Rejected { status, body: text });
        }

        let resp_json: Value = serde_json::from_str(&text)?;
        let raw = resp_json["instance"]["state"]
            .as_str()
            .or_else(|| resp_json["state"].as_str())
            .or_else(|| resp_json["status"].as_str())
            .or_else(|| resp_json["instance"]["status"].as_str())
            .unwrap_or("");

        debug!(
            component = "gateway",
            event = "gateway.connection_state",
            instance = %instance_name,
            state = %raw,
            "Connection state"
        );

        ConnState::from_gateway(raw).ok_or_else(|| {
            GatewayError::UnexpectedResponse(format!(
                "unknown connection state in {}",
                preview(&text)
            ))
        })
    }

    async fn qr_code(
        &self,
        cfg: &GlobalGatewayConfig,
        instance_name: &str,
        deadline: Duration,
    ) -> Result<String, GatewayError> {
        let url = endpoint(cfg, &["instance", "connect", instance_name])?;
        let (status, text) = self
            .send(
                self.http.get(url).header("apikey", &cfg.master_api_key),
                deadline,
            )
            .await?;

        if !is_success(status) {
            return Err(GatewayError::Rejected { status, body: text });
        }

        let resp_json: Value = serde_json::from_str(&text)?;
        match extract_qr(&resp_json) {
            Some(qr) => {
                info!(
                    component = "gateway",
                    event = "gateway.qr.fetched",
                    instance = %instance_name,
                    bytes = qr.len(),
                    "QR payload fetched"
                );
                Ok(qr)
            }
            None => Err(GatewayError::UnexpectedResponse(format!(
                "no QR payload in {}",
                preview(&text)
            ))),
        }
    }

    async fn disconnect(
        &self,
        cfg: &GlobalGatewayConfig,
        instance_name: &str,
        deadline: Duration,
    ) -> Result<(), GatewayError> {
        let url = endpoint(cfg, &["instance", "logout", instance_name])?;
        let (status, text) = self
            .send(
                self.http.delete(url).header("apikey", &cfg.master_api_key),
                deadline,
            )
            .await?;

        if is_success(status) {
            info!(
                component = "gateway",
                event = "gateway.instance.logout",
                instance = %instance_name,
                "Instance logged out"
            );
            return Ok(());
        }

        if status == 404 || is_already_disconnected(&text) {
            debug!(
                component = "gateway",
                event = "gateway.instance.logout.noop",
                instance = %instance_name,
                status = status,
                "Instance was already disconnected"
            );
            return Ok(());
        }

        Err(GatewayError::Rejected { status, body: text })
    }

    async fn delete_instance(
        &self,
        cfg: &GlobalGatewayConfig,
        instance_name: &str,
        deadline: Duration,
    ) -> Result<(), GatewayError> {
        let url = endpoint(cfg, &["instance", "delete", instance_name])?;
        let (status, text) = self
            .send(
                self.http.delete(url).header("apikey", &cfg.master_api_key),
                deadline,
            )
            .await?;

        info!(
            component = "gateway",
            event = "gateway.instance.delete",
            instance = %instance_name,
            status = status,
            body = %preview(&text),
            "Delete instance response"
        );

        if is_success(status) || status == 404 {
            Ok(())
        } else {
            Err(GatewayError::Rejected { status, body: text })
        }
    }
}

/// Extract a QR payload from the response shapes the gateway uses.
///
/// create:  `{ "qrcode": { "base64": "data:image/...", "code": "2@..." } }`
/// connect: `{ "base64": "data:image/...", "code": "2@..." }`
///
/// The rendered image is preferred over the raw pairing code.
pub fn extract_qr(resp: &Value) -> Option<String> {
    [
        &resp["qrcode"]["base64"],
        &resp["base64"],
        &resp["qrcode"],
        &resp["qrcode"]["code"],
        &resp["code"],
        &resp["pairingCode"],
    ]
    .into_iter()
    .filter_map(Value::as_str)
    .map(str::trim)
    .find(|s| !s.is_empty())
    .map(str::to_string)
}

fn endpoint(cfg: &GlobalGatewayConfig, segments: &[&str]) -> Result<reqwest::Url, GatewayError> {
    let base = cfg.base_url.trim().trim_end_matches('/');
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| GatewayError::InvalidBaseUrl(format!("{}: {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| GatewayError::InvalidBaseUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn transport_error(err: reqwest::Error, deadline: Duration) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(deadline)
    } else {
        GatewayError::Unreachable(err.to_string())
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

fn is_already_disconnected(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("not connected")
        || lower.contains("already")
        || lower.contains("does not exist")
        || lower.contains("connection closed")
}

fn instance_token() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("pl-{}", &raw[..12])
}

fn preview(text: &str) -> String {
    text.chars().take(LOG_PREVIEW_CHARS).collect()
}
