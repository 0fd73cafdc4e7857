//! Gateway call helpers shared by the session actor and its scheduler.

use std::future::Future;
use std::time::Duration;

use pairline_gateway::{CreateInstance, GatewayClient, GatewayError, GlobalGatewayConfig};
use tracing::info;

use crate::config_resolver::TenantContext;
use crate::settings::PairingConfig;

/// Run a gateway call under a hard deadline, whatever the client does itself.
pub async fn bounded<T, F>(deadline: Duration, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout(deadline)),
    }
}

/// Create the instance and return its first QR payload.
///
/// A name or token collision from an earlier attempt is cleared by deleting
/// the stale instance and creating once more. When the creation response
/// carries no QR, one is fetched.
pub async fn provision(
    gateway: &dyn GatewayClient,
    cfg: &GlobalGatewayConfig,
    tenant: &TenantContext,
    instance_name: &str,
    settings: &PairingConfig,
) -> Result<String, GatewayError> {
    let deadline = settings.call_deadline;
    let request = CreateInstance {
        instance_name: instance_name.to_string(),
        phone_number: tenant.tenant_phone_number.clone(),
        webhook_url: settings.webhook_url.clone(),
        events: settings.events.clone(),
    };

    let created = match bounded(deadline, gateway.create_instance(cfg, &request, deadline)).await {
        Err(e) if e.is_name_conflict() => {
            info!(
                component = "provisioning",
                event = "provisioning.name_conflict",
                instance = %instance_name,
                "Instance name already taken, deleting and recreating"
            );
            bounded(deadline, gateway.delete_instance(cfg, instance_name, deadline)).await?;
            bounded(deadline, gateway.create_instance(cfg, &request, deadline)).await?
        }
        other => other?,
    };

    match created.qr_payload {
        Some(qr) => Ok(qr),
        None => bounded(deadline, gateway.qr_code(cfg, instance_name, deadline)).await,
    }
}
