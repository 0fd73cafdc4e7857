//! Timing and policy knobs for the pairing lifecycle.

use std::time::Duration;

use anyhow::Context;
use pairline_gateway::DEFAULT_EVENTS;
use reqwest::Url;

/// How a QR is renewed when the refresh timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QrRefreshPolicy {
    /// Ask the existing instance for a new code.
    #[default]
    FetchQr,
    /// Delete and re-create the instance; for gateways that bind one QR per instance.
    RecreateInstance,
}

#[derive(Debug, Clone)]
pub struct PairingConfig {
    pub qr_refresh_interval: Duration,
    pub poll_interval: Duration,
    /// Overall budget for a device to link, independent of per-call deadlines.
    pub pairing_timeout: Duration,
    /// Deadline applied to every outbound gateway call.
    pub call_deadline: Duration,
    pub qr_policy: QrRefreshPolicy,
    /// How long a `Disconnected` or `Failed` actor lingers before it exits.
    pub idle_actor_timeout: Duration,
    pub webhook_url: Option<String>,
    pub events: Vec<String>,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            qr_refresh_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            pairing_timeout: Duration::from_secs(300),
            call_deadline: Duration::from_secs(15),
            qr_policy: QrRefreshPolicy::FetchQr,
            idle_actor_timeout: Duration::from_secs(600),
            webhook_url: None,
            events: DEFAULT_EVENTS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// The webhook URL handed to the gateway, carrying `token` when the server
/// requires one. A URL that already names a token is left alone.
pub fn webhook_url_with_token(url: &str, token: Option<&str>) -> anyhow::Result<String> {
    let Some(token) = token else {
        return Ok(url.to_string());
    };
    let mut parsed = Url::parse(url).with_context(|| format!("invalid webhook URL {url:?}"))?;
    if parsed.query_pairs().any(|(key, _)| key == "token") {
        return Ok(url.to_string());
    }
    parsed.query_pairs_mut().append_pair("token", token);
    Ok(parsed.into())
}
