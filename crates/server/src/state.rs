//! Application state shared by HTTP and WebSocket handlers

use std::sync::Arc;

use crate::manager::PairingSessionManager;
use crate::webhook::WebhookEventIngester;

pub struct AppState {
    pub manager: Arc<PairingSessionManager>,
    pub ingester: Arc<WebhookEventIngester>,
    /// When set, webhook calls must carry `?token=<value>`.
    pub webhook_token: Option<String>,
}

impl AppState {
    pub fn new(
        manager: Arc<PairingSessionManager>,
        ingester: Arc<WebhookEventIngester>,
        webhook_token: Option<String>,
    ) -> Self {
        Self {
            manager,
            ingester,
            webhook_token,
        }
    }
}
