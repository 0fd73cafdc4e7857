//! Session actor: owns one pairing session and processes commands sequentially.
//!
//! Each session runs as an independent tokio task. External callers
//! communicate via `SessionActorHandle` which sends `SessionCommand`
//! messages over an mpsc channel. Lock-free reads go through `ArcSwap`.
//!
//! Because every write to a session goes through its actor, webhook events,
//! poll results and caller operations for the same session never interleave.
//! Actors of `Disconnected` or `Failed` sessions exit after sitting idle.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use pairline_gateway::{GatewayClient, GlobalGatewayConfig};
use pairline_protocol::{ConnState, PairingSession, PairingStatus, ServerMessage, SessionKey};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config_resolver::TenantContext;
use crate::error::PairingError;
use crate::persistence::SessionStore;
use crate::provisioning::{bounded, provision};
use crate::scheduler::{ScheduleJob, SchedulerHandle};
use crate::session_command::{PairingContext, Reply, SchedulerEvent, SessionCommand};
use crate::settings::PairingConfig;
use crate::transition::{
    is_valid_edge, reconcile_with_stored, rejection, transition, Effect, Input, Source,
    TransitionState,
};

const COMMAND_BUFFER: usize = 64;

/// Shared collaborators every actor needs.
#[derive(Clone)]
pub struct ActorDeps {
    pub gateway: Arc<dyn GatewayClient>,
    pub store: Arc<dyn SessionStore>,
    pub settings: Arc<PairingConfig>,
    pub clock: Clock,
    pub events: broadcast::Sender<ServerMessage>,
}

/// Handle to a running session actor (cheap to Clone).
#[derive(Clone)]
pub struct SessionActorHandle {
    key: SessionKey,
    command_tx: mpsc::Sender<SessionCommand>,
    snapshot: Arc<ArcSwap<PairingSession>>,
}

impl SessionActorHandle {
    pub fn spawn(session: PairingSession, deps: ActorDeps) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let key = session.key();
        let snapshot = Arc::new(ArcSwap::from_pointee(session.clone()));

        let actor = SessionActor {
            state: TransitionState::new(session),
            deps,
            snapshot: snapshot.clone(),
            scheduler: None,
            generation: 0,
            context: None,
            self_tx: command_tx.downgrade(),
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            key,
            command_tx,
            snapshot,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Send a command to the actor (fire-and-forget).
    pub async fn send(&self, cmd: SessionCommand) -> Result<(), PairingError> {
        self.command_tx.send(cmd).await.map_err(|_| {
            warn!(
                component = "session_actor",
                event = "session.command_dropped",
                session = %self.key,
                "Actor channel closed, command dropped"
            );
            PairingError::ActorUnavailable
        })
    }

    /// Send a command carrying a reply channel and wait for the answer.
    pub async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, PairingError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await.map_err(|_| PairingError::ActorUnavailable)?
    }

    /// Current row, ordered after every command already queued.
    #[cfg(test)]
    pub async fn get(&self) -> Result<PairingSession, PairingError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::GetSession { reply: tx }).await?;
        rx.await.map_err(|_| PairingError::ActorUnavailable)
    }

    /// Stop the actor's timers and wait for it to acknowledge.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(SessionCommand::Shutdown { reply: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<PairingSession> {
        self.snapshot.load_full()
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

struct SessionActor {
    state: TransitionState,
    deps: ActorDeps,
    snapshot: Arc<ArcSwap<PairingSession>>,
    scheduler: Option<SchedulerHandle>,
    generation: u64,
    context: Option<PairingContext>,
    self_tx: mpsc::WeakSender<SessionCommand>,
}

impl SessionActor {
    async fn run(mut self, mut command_rx: mpsc::Receiver<SessionCommand>) {
        loop {
            let next = if self.is_idle() {
                let idle_timeout = self.deps.settings.idle_actor_timeout;
                match tokio::time::timeout(idle_timeout, command_rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        // Commands still queued are dropped with their reply
                        // channels; the manager respawns from the stored row.
                        command_rx.close();
                        debug!(
                            component = "session_actor",
                            event = "session.retired",
                            session = %self.state.session.key(),
                            status = %self.state.session.status,
                            "Idle actor retired"
                        );
                        return;
                    }
                }
            } else {
                command_rx.recv().await
            };
            let Some(cmd) = next else { break };

            match cmd {
                SessionCommand::Shutdown { reply } => {
                    self.stop_scheduler().await;
                    let _ = reply.send(());
                    return;
                }
                SessionCommand::Remove { gateway, reply } => {
                    let result = self.remove(gateway).await;
                    let removed = result.is_ok();
                    let _ = reply.send(result);
                    if removed {
                        return;
                    }
                }
                other => self.handle(other).await,
            }
        }
        self.stop_scheduler().await;
    }

    /// Nothing left to drive: no timers, and only a caller can move it on.
    fn is_idle(&self) -> bool {
        self.scheduler.is_none()
            && matches!(
                self.state.session.status,
                PairingStatus::Disconnected | PairingStatus::Failed
            )
    }

    async fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            #[cfg(test)]
            SessionCommand::GetSession { reply } => {
                let _ = reply.send(self.state.session.clone());
            }
            SessionCommand::Start {
                gateway,
                tenant,
                reply,
            } => {
                let result = self.start(gateway, tenant).await;
                let _ = reply.send(result);
            }
            SessionCommand::RefreshQr { gateway, reply } => {
                let result = self.refresh_qr(gateway).await;
                let _ = reply.send(result);
            }
            SessionCommand::Disconnect { gateway, reply } => {
                let result = self.disconnect(gateway).await;
                let _ = reply.send(result);
            }
            SessionCommand::Observe { state, observed_at } => {
                self.sync_from_store().await;
                self.observe(state, Source::Webhook, observed_at).await;
            }
            SessionCommand::QrPushed { qr_payload } => {
                self.sync_from_store().await;
                self.replace_qr(qr_payload).await;
            }
            SessionCommand::Rejected { reason } => {
                self.sync_from_store().await;
                let error = rejection(reason, self.deps.clock.now());
                self.apply(Input::PairingRejected { error }).await;
            }
            SessionCommand::Resume { context } => self.resume(context).await,
            SessionCommand::Scheduler(event) => self.on_scheduler_event(event).await,
            SessionCommand::Shutdown { .. } | SessionCommand::Remove { .. } => {}
        }
    }

    async fn start(
        &mut self,
        gateway: GlobalGatewayConfig,
        tenant: TenantContext,
    ) -> Result<PairingSession, PairingError> {
        self.sync_from_store().await;
        if self.state.session.status.is_live() {
            info!(
                component = "session_actor",
                event = "session.start_reused",
                session = %self.state.session.key(),
                status = %self.state.session.status,
                "Pairing already in progress, returning current session"
            );
            return Ok(self.state.session.clone());
        }

        self.context = Some(PairingContext {
            gateway: gateway.clone(),
            tenant: Some(tenant.clone()),
        });
        self.apply(Input::StartRequested).await;

        let provisioned = provision(
            self.deps.gateway.as_ref(),
            &gateway,
            &tenant,
            &self.state.session.instance_name,
            &self.deps.settings,
        )
        .await;

        match provisioned {
            Ok(qr_payload) => {
                self.apply(Input::Provisioned { qr_payload }).await;
                info!(
                    component = "session_actor",
                    event = "session.provisioned",
                    session = %self.state.session.key(),
                    "Instance provisioned, waiting for scan"
                );
                Ok(self.state.session.clone())
            }
            Err(e) => {
                let err = PairingError::from_provisioning(e);
                warn!(
                    component = "session_actor",
                    event = "session.provision_failed",
                    session = %self.state.session.key(),
                    error = %err,
                    "Provisioning failed"
                );
                let error = err.to_session_error(self.deps.clock.now());
                self.apply(Input::ProvisionFailed { error }).await;
                Err(err)
            }
        }
    }

    async fn refresh_qr(
        &mut self,
        gateway: GlobalGatewayConfig,
    ) -> Result<PairingSession, PairingError> {
        self.sync_from_store().await;
        let status = self.state.session.status;
        if status != PairingStatus::WaitingForScan {
            return Err(PairingError::NotWaitingForScan {
                key: self.state.session.key().to_string(),
                status,
            });
        }
        if let Some(context) = self.context.as_mut() {
            context.gateway = gateway.clone();
        }

        let deadline = self.deps.settings.call_deadline;
        let qr_payload = bounded(
            deadline,
            self.deps
                .gateway
                .qr_code(&gateway, &self.state.session.instance_name, deadline),
        )
        .await
        .map_err(PairingError::from_provisioning)?;

        self.replace_qr(qr_payload).await;
        Ok(self.state.session.clone())
    }

    async fn disconnect(
        &mut self,
        gateway: Result<GlobalGatewayConfig, String>,
    ) -> Result<PairingSession, PairingError> {
        self.sync_from_store().await;
        if self.state.session.status == PairingStatus::Disconnected {
            return Ok(self.state.session.clone());
        }

        // Nothing may fire between the logout call and the local reset.
        self.stop_scheduler().await;

        let outcome = self.logout(gateway).await;
        let error = outcome
            .as_ref()
            .err()
            .map(|e| e.to_session_error(self.deps.clock.now()));
        self.apply(Input::DisconnectRequested { error }).await;

        info!(
            component = "session_actor",
            event = "session.disconnected",
            session = %self.state.session.key(),
            logout_ok = outcome.is_ok(),
            "Session disconnected"
        );
        outcome.map(|_| self.state.session.clone())
    }

    async fn logout(
        &self,
        gateway: Result<GlobalGatewayConfig, String>,
    ) -> Result<(), PairingError> {
        let cfg = gateway.map_err(PairingError::DisconnectFailed)?;
        let deadline = self.deps.settings.call_deadline;
        bounded(
            deadline,
            self.deps
                .gateway
                .disconnect(&cfg, &self.state.session.instance_name, deadline),
        )
        .await
        .map_err(|e| PairingError::DisconnectFailed(e.to_string()))
    }

    async fn remove(
        &mut self,
        gateway: Result<GlobalGatewayConfig, String>,
    ) -> Result<(), PairingError> {
        // The row goes first: a failed delete leaves the session running as it was.
        let (tenant_id, instance_name) = (
            self.state.session.tenant_id.clone(),
            self.state.session.instance_name.clone(),
        );
        if let Err(e) = self.deps.store.delete(&tenant_id, &instance_name).await {
            warn!(
                component = "session_actor",
                event = "session.remove_failed",
                session = %self.state.session.key(),
                error = %e,
                "Could not delete session row, session left untouched"
            );
            return Err(e.into());
        }

        self.stop_scheduler().await;
        if self.state.session.status != PairingStatus::Disconnected {
            if let Err(e) = self.logout(gateway).await {
                warn!(
                    component = "session_actor",
                    event = "session.remove_logout_failed",
                    session = %self.state.session.key(),
                    error = %e,
                    "Logout before removal failed, removing anyway"
                );
            }
        }

        let _ = self.deps.events.send(ServerMessage::SessionRemoved {
            tenant_id,
            instance_name,
        });

        info!(
            component = "session_actor",
            event = "session.removed",
            session = %self.state.session.key(),
            "Session removed"
        );
        Ok(())
    }

    async fn resume(&mut self, context: Option<PairingContext>) {
        let now = self.deps.clock.now();
        match self.state.session.status {
            PairingStatus::Provisioning => {
                let error = PairingError::ProvisionFailed {
                    status: None,
                    body: "interrupted by restart".to_string(),
                }
                .to_session_error(now);
                self.apply(Input::ProvisionFailed { error }).await;
            }
            PairingStatus::WaitingForScan => match context {
                Some(context) => {
                    self.context = Some(context);
                    self.start_scheduler().await;
                }
                None => {
                    let error = PairingError::ConfigMissing(
                        "gateway configuration unavailable on restart".to_string(),
                    )
                    .to_session_error(now);
                    self.apply(Input::PairingRejected { error }).await;
                }
            },
            _ => self.context = context,
        }
    }

    async fn on_scheduler_event(&mut self, event: SchedulerEvent) {
        let current = self.scheduler.as_ref().map(|s| s.generation);
        if current != Some(event.generation()) {
            debug!(
                component = "session_actor",
                event = "scheduler.stale_event",
                session = %self.state.session.key(),
                generation = event.generation(),
                "Dropping result from a stopped scheduler"
            );
            return;
        }

        self.sync_from_store().await;
        let now = self.deps.clock.now();

        match event {
            SchedulerEvent::Polled {
                result: Ok(state),
                observed_at,
                ..
            } => {
                self.observe(state, Source::Poll, observed_at).await;
            }
            SchedulerEvent::Polled { result: Err(e), .. } if e.is_not_found() => {
                let error = rejection("instance no longer exists at the gateway", now);
                self.apply(Input::PairingRejected { error }).await;
            }
            SchedulerEvent::Polled { result: Err(e), .. } => {
                warn!(
                    component = "session_actor",
                    event = "session.poll_failed",
                    session = %self.state.session.key(),
                    error = %e,
                    "Connection poll failed, will retry"
                );
                self.apply(Input::TransientFailure {
                    message: e.to_string(),
                })
                .await;
            }
            SchedulerEvent::QrRegenerated {
                result: Ok(qr_payload),
                ..
            } => {
                self.apply(Input::QrRefreshed { qr_payload }).await;
            }
            SchedulerEvent::QrRegenerated { result: Err(e), .. } => {
                warn!(
                    component = "session_actor",
                    event = "session.qr_refresh_failed",
                    session = %self.state.session.key(),
                    error = %e,
                    "QR regeneration failed, keeping previous code"
                );
                self.apply(Input::TransientFailure {
                    message: e.to_string(),
                })
                .await;
            }
            SchedulerEvent::BudgetExhausted { .. } => {
                let budget_secs = self.deps.settings.pairing_timeout.as_secs();
                warn!(
                    component = "session_actor",
                    event = "session.pairing_timeout",
                    session = %self.state.session.key(),
                    budget_secs,
                    "No device linked within the pairing budget"
                );
                self.apply(Input::BudgetExhausted { budget_secs }).await;
            }
        }
    }

    async fn observe(&mut self, state: ConnState, source: Source, observed_at: DateTime<Utc>) {
        debug!(
            component = "session_actor",
            event = "session.observed",
            session = %self.state.session.key(),
            source = source.as_str(),
            state = %state,
            "Connection state observed"
        );
        self.apply(Input::ConnectionObserved {
            state,
            source,
            observed_at,
        })
        .await;
    }

    /// Install a QR that did not come from the scheduler's own timer.
    async fn replace_qr(&mut self, qr_payload: String) {
        let issued_before = self.state.session.qr_issued_at;
        self.apply(Input::QrRefreshed { qr_payload }).await;
        if self.state.session.qr_issued_at != issued_before {
            if let Some(scheduler) = &self.scheduler {
                scheduler.reset_qr_timer();
            }
        }
    }

    /// Adopt a newer, higher-ranked row written behind our back.
    async fn sync_from_store(&mut self) {
        let (tenant_id, instance_name) = (
            self.state.session.tenant_id.clone(),
            self.state.session.instance_name.clone(),
        );
        let stored = match self.deps.store.get(&tenant_id, &instance_name).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return,
            Err(e) => {
                warn!(
                    component = "session_actor",
                    event = "session.store_read_failed",
                    session = %self.state.session.key(),
                    error = %e,
                    "Store read failed, continuing with in-memory state"
                );
                return;
            }
        };

        let before = self.state.session.status;
        self.state.session = reconcile_with_stored(self.state.session.clone(), stored);
        let after = self.state.session.status;
        if before == after {
            return;
        }

        info!(
            component = "session_actor",
            event = "session.adopted_stored",
            session = %self.state.session.key(),
            from = %before,
            to = %after,
            "Adopted newer stored status"
        );
        self.snapshot.store(Arc::new(self.state.session.clone()));
        if after != PairingStatus::WaitingForScan {
            self.stop_scheduler().await;
        }
    }

    async fn apply(&mut self, input: Input) {
        let now = self.deps.clock.now();
        let before = self.state.session.status;
        let (next, effects) = transition(self.state.clone(), input, now);
        self.state = next;

        let after = self.state.session.status;
        if !is_valid_edge(before, after) {
            error!(
                component = "session_actor",
                event = "session.invalid_edge",
                session = %self.state.session.key(),
                from = %before,
                to = %after,
                "Transition outside the lifecycle graph"
            );
        }

        for effect in effects {
            match effect {
                Effect::Persist => self.persist().await,
                Effect::StartScheduler => self.start_scheduler().await,
                Effect::StopScheduler => self.stop_scheduler().await,
            }
        }
    }

    async fn persist(&mut self) {
        let session = self.state.session.clone();
        if let Err(e) = self.deps.store.upsert(&session).await {
            error!(
                component = "session_actor",
                event = "session.persist_failed",
                session = %session.key(),
                error = %e,
                "Failed to persist session"
            );
        }

        debug!(
            component = "session_actor",
            event = "session.persisted",
            session = %session.key(),
            status = %session.status,
            "Session persisted"
        );
        if session.status == PairingStatus::Failed {
            if let Some(err) = &session.last_error {
                info!(
                    component = "session_actor",
                    event = "session.failed",
                    session = %session.key(),
                    kind = ?err.kind,
                    message = %err.message,
                    "Session failed"
                );
            }
        }

        self.snapshot.store(Arc::new(session.clone()));
        let _ = self
            .deps
            .events
            .send(ServerMessage::SessionUpdated { session });
    }

    async fn start_scheduler(&mut self) {
        self.stop_scheduler().await;
        let Some(context) = self.context.clone() else {
            error!(
                component = "session_actor",
                event = "scheduler.missing_context",
                session = %self.state.session.key(),
                "Cannot start scheduler without gateway context"
            );
            return;
        };

        self.generation += 1;
        let job = ScheduleJob {
            generation: self.generation,
            instance_name: self.state.session.instance_name.clone(),
            context,
            gateway: self.deps.gateway.clone(),
            settings: self.deps.settings.clone(),
            clock: self.deps.clock,
        };
        self.scheduler = Some(SchedulerHandle::spawn(job, self.self_tx.clone()));
    }

    async fn stop_scheduler(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            let generation = scheduler.generation;
            scheduler.stop().await;
            debug!(
                component = "session_actor",
                event = "scheduler.stopped",
                session = %self.state.session.key(),
                generation,
                "Scheduler stopped"
            );
        }
    }
}

