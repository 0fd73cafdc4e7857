//! Commands sent to a session actor from the manager, the webhook ingester
//! and the session's own scheduler.

use chrono::{DateTime, Utc};
use pairline_gateway::{GatewayError, GlobalGatewayConfig};
use pairline_protocol::PairingSession;
use pairline_protocol::ConnState;
use tokio::sync::oneshot;

use crate::config_resolver::TenantContext;
use crate::error::PairingError;

pub type Reply<T> = oneshot::Sender<Result<T, PairingError>>;

/// Credentials a session needs to talk to the gateway on its own.
#[derive(Debug, Clone)]
pub struct PairingContext {
    pub gateway: GlobalGatewayConfig,
    /// Absent for sessions resumed without a resolvable tenant; the scheduler
    /// then cannot re-create the instance and fetches QRs instead.
    pub tenant: Option<TenantContext>,
}

pub enum SessionCommand {
    // -- Queries --
    #[cfg(test)]
    GetSession {
        reply: oneshot::Sender<PairingSession>,
    },

    // -- Caller operations --
    Start {
        gateway: GlobalGatewayConfig,
        tenant: TenantContext,
        reply: Reply<PairingSession>,
    },
    RefreshQr {
        gateway: GlobalGatewayConfig,
        reply: Reply<PairingSession>,
    },
    /// The gateway config may be unavailable (carried as the resolver's error
    /// message); the session is still reset locally.
    Disconnect {
        gateway: Result<GlobalGatewayConfig, String>,
        reply: Reply<PairingSession>,
    },
    /// Disconnect (best effort) and delete the row. The actor exits afterwards.
    Remove {
        gateway: Result<GlobalGatewayConfig, String>,
        reply: Reply<()>,
    },

    // -- Webhook events --
    Observe {
        state: ConnState,
        observed_at: DateTime<Utc>,
    },
    QrPushed {
        qr_payload: String,
    },
    Rejected {
        reason: String,
    },

    // -- Lifecycle --
    /// Settle a row loaded at startup: restart the scheduler for
    /// `WaitingForScan`, fail an interrupted `Provisioning`.
    Resume {
        context: Option<PairingContext>,
    },
    Scheduler(SchedulerEvent),
    /// Stop timers and exit.
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Results reported by a session's scheduler task. Tagged with the
/// scheduler generation so results from a stopped scheduler are discarded.
#[derive(Debug)]
pub enum SchedulerEvent {
    Polled {
        generation: u64,
        result: Result<ConnState, GatewayError>,
        observed_at: DateTime<Utc>,
    },
    QrRegenerated {
        generation: u64,
        result: Result<String, GatewayError>,
    },
    BudgetExhausted {
        generation: u64,
    },
}

impl SchedulerEvent {
    pub fn generation(&self) -> u64 {
        match self {
            SchedulerEvent::Polled { generation, .. }
            | SchedulerEvent::QrRegenerated { generation, .. }
            | SchedulerEvent::BudgetExhausted { generation } => *generation,
        }
    }
}
