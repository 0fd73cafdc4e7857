//! Per-session QR refresh timer and connection poller.
//!
//! One task per session in `WaitingForScan`. It ticks on two cadences, runs
//! the gateway calls itself, and reports results back to the owning actor as
//! `SchedulerEvent`s. The pairing budget races every in-flight call so it
//! fires on time even when the gateway is slow.

use std::sync::Arc;

use pairline_gateway::{GatewayClient, GatewayError};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::debug;

use crate::clock::Clock;
use crate::provisioning::{bounded, provision};
use crate::session_command::{PairingContext, SchedulerEvent, SessionCommand};
use crate::settings::{PairingConfig, QrRefreshPolicy};

/// Everything the scheduler task needs; owned by the task.
pub struct ScheduleJob {
    pub generation: u64,
    pub instance_name: String,
    pub context: PairingContext,
    pub gateway: Arc<dyn GatewayClient>,
    pub settings: Arc<PairingConfig>,
    pub clock: Clock,
}

/// Handle to a running scheduler. Owned by the session actor.
pub struct SchedulerHandle {
    pub generation: u64,
    qr_reset: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn spawn(job: ScheduleJob, events: mpsc::WeakSender<SessionCommand>) -> Self {
        let generation = job.generation;
        let qr_reset = Arc::new(Notify::new());
        let task = tokio::spawn(run(job, events, qr_reset.clone()));
        Self {
            generation,
            qr_reset,
            task,
        }
    }

    /// Restart the QR cadence from now, after a code arrived from elsewhere.
    pub fn reset_qr_timer(&self) {
        self.qr_reset.notify_one();
    }

    /// Cancel the task and wait until it has fully stopped.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn run(
    job: ScheduleJob,
    events: mpsc::WeakSender<SessionCommand>,
    qr_reset: Arc<Notify>,
) {
    let settings = job.settings.clone();
    let start = Instant::now();
    let generation = job.generation;

    let budget = sleep_until(start + settings.pairing_timeout);
    tokio::pin!(budget);

    let mut poll = interval_at(start + settings.poll_interval, settings.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut qr = interval_at(
        start + settings.qr_refresh_interval,
        settings.qr_refresh_interval,
    );
    qr.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(
        component = "scheduler",
        event = "scheduler.started",
        instance = %job.instance_name,
        generation,
        "Scheduler started"
    );

    loop {
        let event = tokio::select! {
            biased;
            _ = &mut budget => SchedulerEvent::BudgetExhausted { generation },
            _ = qr_reset.notified() => {
                qr.reset();
                debug!(
                    component = "scheduler",
                    event = "scheduler.qr_timer_reset",
                    instance = %job.instance_name,
                    generation,
                    "QR refresh timer restarted"
                );
                continue;
            }
            _ = poll.tick() => {
                tokio::select! {
                    biased;
                    _ = &mut budget => SchedulerEvent::BudgetExhausted { generation },
                    result = job.poll() => SchedulerEvent::Polled {
                        generation,
                        result,
                        observed_at: job.clock.now(),
                    },
                }
            }
            _ = qr.tick() => {
                tokio::select! {
                    biased;
                    _ = &mut budget => SchedulerEvent::BudgetExhausted { generation },
                    result = job.regenerate_qr() => SchedulerEvent::QrRegenerated { generation, result },
                }
            }
        };

        let last = matches!(event, SchedulerEvent::BudgetExhausted { .. });
        if !emit(&events, event).await || last {
            return;
        }
    }
}

async fn emit(events: &mpsc::WeakSender<SessionCommand>, event: SchedulerEvent) -> bool {
    let Some(tx) = events.upgrade() else {
        return false;
    };
    tx.send(SessionCommand::Scheduler(event)).await.is_ok()
}

impl ScheduleJob {
    async fn poll(&self) -> Result<pairline_protocol::ConnState, GatewayError> {
        let deadline = self.settings.call_deadline;
        bounded(
            deadline,
            self.gateway
                .connection_state(&self.context.gateway, &self.instance_name, deadline),
        )
        .await
    }

    async fn regenerate_qr(&self) -> Result<String, GatewayError> {
        let deadline = self.settings.call_deadline;
        let cfg = &self.context.gateway;
        match (self.settings.qr_policy, &self.context.tenant) {
            (QrRefreshPolicy::RecreateInstance, Some(tenant)) => {
                bounded(
                    deadline,
                    self.gateway
                        .delete_instance(cfg, &self.instance_name, deadline),
                )
                .await?;
                provision(
                    self.gateway.as_ref(),
                    cfg,
                    tenant,
                    &self.instance_name,
                    &self.settings,
                )
                .await
            }
            _ => {
                bounded(
                    deadline,
                    self.gateway.qr_code(cfg, &self.instance_name, deadline),
                )
                .await
            }
        }
    }
}
