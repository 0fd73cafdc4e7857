//! Pairing session manager: registry of session actors.
//!
//! Resolves credentials, names instances, and routes caller operations and
//! webhook events to the one actor that owns each (tenant, instance) pair.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pairline_protocol::{ConnState, PairingSession, PairingStatus, ServerMessage, SessionKey};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config_resolver::ConfigResolver;
use crate::error::PairingError;
use crate::instance_naming::InstanceNamer;
use crate::session_actor::{ActorDeps, SessionActorHandle};
use crate::session_command::{PairingContext, Reply, SessionCommand};

pub struct PairingSessionManager {
    sessions: DashMap<SessionKey, SessionActorHandle>,
    resolver: Arc<ConfigResolver>,
    namer: Arc<dyn InstanceNamer>,
    deps: ActorDeps,
}

impl PairingSessionManager {
    pub fn new(
        resolver: Arc<ConfigResolver>,
        namer: Arc<dyn InstanceNamer>,
        deps: ActorDeps,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            resolver,
            namer,
            deps,
        }
    }

    /// Begin pairing for a tenant, or return the session already in progress.
    ///
    /// Without an explicit instance name the tenant's live session is reused;
    /// otherwise the naming policy picks one.
    pub async fn start_pairing(
        &self,
        tenant_id: &str,
        instance_name: Option<String>,
    ) -> Result<PairingSession, PairingError> {
        let (gateway, tenant) = self.resolver.resolve(tenant_id).await?;

        let instance_name = match instance_name.filter(|n| !n.trim().is_empty()) {
            Some(name) => name.trim().to_string(),
            None => match self.live_session_of(tenant_id) {
                Some(existing) => existing,
                None => self.namer.instance_name(&tenant, self.deps.clock.now()),
            },
        };

        info!(
            component = "manager",
            event = "pairing.start_requested",
            tenant_id = %tenant_id,
            instance = %instance_name,
            "Pairing requested"
        );

        self.call(SessionKey::new(tenant_id, &instance_name), true, |reply| {
            SessionCommand::Start {
                gateway: gateway.clone(),
                tenant: tenant.clone(),
                reply,
            }
        })
        .await
    }

    /// Fetch a fresh QR for a session still waiting for a scan.
    pub async fn refresh_qr(
        &self,
        tenant_id: &str,
        instance_name: &str,
    ) -> Result<PairingSession, PairingError> {
        let key = self.existing(tenant_id, instance_name).await?;
        let gateway = self.resolver.gateway().await?;
        self.call(key, false, |reply| SessionCommand::RefreshQr {
            gateway: gateway.clone(),
            reply,
        })
        .await
    }

    /// Log the device out and reset the session to `Disconnected`.
    ///
    /// The local reset happens even when the gateway call fails; the failure is
    /// then returned as `DisconnectFailed`.
    pub async fn disconnect(
        &self,
        tenant_id: &str,
        instance_name: &str,
    ) -> Result<PairingSession, PairingError> {
        let key = self.existing(tenant_id, instance_name).await?;
        let gateway = self.resolver.gateway().await.map_err(|e| e.to_string());
        self.call(key, false, |reply| SessionCommand::Disconnect {
            gateway: gateway.clone(),
            reply,
        })
        .await
    }

    /// Disconnect (best effort) and delete the session row.
    pub async fn remove(&self, tenant_id: &str, instance_name: &str) -> Result<(), PairingError> {
        let key = self.existing(tenant_id, instance_name).await?;
        let gateway = self.resolver.gateway().await.map_err(|e| e.to_string());
        self.call(key.clone(), false, |reply| SessionCommand::Remove {
            gateway: gateway.clone(),
            reply,
        })
        .await?;
        self.sessions.remove(&key);
        Ok(())
    }

    pub async fn session(
        &self,
        tenant_id: &str,
        instance_name: &str,
    ) -> Result<PairingSession, PairingError> {
        let key = SessionKey::new(tenant_id, instance_name);
        if let Some(handle) = self.registered(&key) {
            return Ok((*handle.snapshot()).clone());
        }
        self.deps
            .store
            .get(tenant_id, instance_name)
            .await?
            .ok_or_else(|| PairingError::SessionNotFound(key.to_string()))
    }

    /// Every known session, persisted rows overlaid with live snapshots.
    pub async fn list(&self) -> Result<Vec<PairingSession>, PairingError> {
        let mut sessions = self.deps.store.list().await?;
        for session in sessions.iter_mut() {
            if let Some(handle) = self.registered(&session.key()) {
                *session = (*handle.snapshot()).clone();
            }
        }
        let stored: Vec<SessionKey> = sessions.iter().map(|s| s.key()).collect();
        let unsaved: Vec<PairingSession> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .filter(|entry| !stored.contains(entry.key()))
            .map(|entry| (*entry.value().snapshot()).clone())
            .collect();
        sessions.extend(unsaved);
        sessions.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(sessions)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.deps.events.subscribe()
    }

    // -- Webhook delivery --------------------------------------------------

    pub async fn observe_connection(
        &self,
        instance_name: &str,
        state: ConnState,
        observed_at: DateTime<Utc>,
    ) -> Result<(), PairingError> {
        self.deliver(instance_name, || SessionCommand::Observe { state, observed_at })
            .await
    }

    pub async fn push_qr(&self, instance_name: &str, qr_payload: String) -> Result<(), PairingError> {
        self.deliver(instance_name, || SessionCommand::QrPushed {
            qr_payload: qr_payload.clone(),
        })
        .await
    }

    pub async fn reject_pairing(&self, instance_name: &str, reason: String) -> Result<(), PairingError> {
        self.deliver(instance_name, || SessionCommand::Rejected {
            reason: reason.clone(),
        })
        .await
    }

    async fn deliver(
        &self,
        instance_name: &str,
        build: impl Fn() -> SessionCommand,
    ) -> Result<(), PairingError> {
        let key = match self.find_by_instance(instance_name) {
            Some(handle) => handle.key().clone(),
            None => self.stored_key_for(instance_name).await?,
        };
        let handle = self.actor_for(key.clone(), false).await?;
        match handle.send(build()).await {
            Err(PairingError::ActorUnavailable) => {
                self.actor_for(key, false).await?.send(build()).await
            }
            result => result,
        }
    }

    /// Key of the most recently updated stored row for a retired actor.
    async fn stored_key_for(&self, instance_name: &str) -> Result<SessionKey, PairingError> {
        self.deps
            .store
            .list()
            .await?
            .into_iter()
            .filter(|session| session.instance_name == instance_name)
            .max_by_key(|session| session.updated_at)
            .map(|session| session.key())
            .ok_or_else(|| PairingError::SessionNotFound(instance_name.to_string()))
    }

    /// The actor owning `instance_name`, whichever tenant it belongs to.
    pub fn find_by_instance(&self, instance_name: &str) -> Option<SessionActorHandle> {
        let mut matches: Vec<SessionActorHandle> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().instance_name == instance_name)
            .filter(|entry| !entry.value().is_closed())
            .map(|entry| entry.value().clone())
            .collect();
        if matches.len() > 1 {
            warn!(
                component = "manager",
                event = "manager.ambiguous_instance",
                instance = %instance_name,
                count = matches.len(),
                "Instance name registered for several tenants, using the most recent"
            );
            matches.sort_by_key(|h| h.snapshot().updated_at);
        }
        matches.pop()
    }

    // -- Lifecycle ---------------------------------------------------------

    /// Load persisted sessions after a restart and settle them.
    pub async fn recover(&self) -> Result<usize, PairingError> {
        let rows = self.deps.store.list().await?;
        let count = rows.len();

        for session in rows {
            let status = session.status;
            let key = session.key();
            let handle = SessionActorHandle::spawn(session, self.deps.clone());
            self.sessions.insert(key.clone(), handle.clone());

            let context = match status {
                PairingStatus::WaitingForScan => self.resume_context(&key.tenant_id).await,
                _ => None,
            };
            if status == PairingStatus::WaitingForScan || status == PairingStatus::Provisioning {
                handle.send(SessionCommand::Resume { context }).await?;
            }
        }

        info!(
            component = "manager",
            event = "manager.recovered",
            sessions = count,
            "Recovered persisted sessions"
        );
        Ok(count)
    }

    /// Stop every session's timers and wait for each actor to acknowledge.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionActorHandle> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        for handle in &handles {
            handle.shutdown().await;
        }
        self.sessions.clear();
        info!(
            component = "manager",
            event = "manager.shutdown",
            sessions = handles.len(),
            "All session schedulers stopped"
        );
    }

    // -- Registry helpers --------------------------------------------------

    fn registered(&self, key: &SessionKey) -> Option<SessionActorHandle> {
        self.sessions
            .get(key)
            .map(|h| h.value().clone())
            .filter(|h| !h.is_closed())
    }

    fn live_session_of(&self, tenant_id: &str) -> Option<String> {
        self.sessions
            .iter()
            .filter(|entry| entry.key().tenant_id == tenant_id)
            .filter(|entry| !entry.value().is_closed())
            .filter(|entry| entry.value().snapshot().status.is_live())
            .map(|entry| entry.key().instance_name.clone())
            .next()
    }

    /// Key of a session that is registered or stored.
    async fn existing(
        &self,
        tenant_id: &str,
        instance_name: &str,
    ) -> Result<SessionKey, PairingError> {
        let key = SessionKey::new(tenant_id, instance_name);
        self.actor_for(key.clone(), false).await?;
        Ok(key)
    }

    /// Send a request to the actor for `key`. An actor that retired between
    /// lookup and delivery drops the request unanswered; it is respawned from
    /// its stored row and asked once more.
    async fn call<T>(
        &self,
        key: SessionKey,
        create: bool,
        build: impl Fn(Reply<T>) -> SessionCommand,
    ) -> Result<T, PairingError> {
        let handle = self.actor_for(key.clone(), create).await?;
        match handle.request(&build).await {
            Err(PairingError::ActorUnavailable) if handle.is_closed() => {
                self.actor_for(key, create).await?.request(build).await
            }
            result => result,
        }
    }

    /// The actor for `key`, spawning one from the stored row (or a fresh row
    /// when `create` is set). Never holds a map guard across an await.
    async fn actor_for(
        &self,
        key: SessionKey,
        create: bool,
    ) -> Result<SessionActorHandle, PairingError> {
        if let Some(handle) = self.registered(&key) {
            return Ok(handle);
        }

        let session = match self
            .deps
            .store
            .get(&key.tenant_id, &key.instance_name)
            .await?
        {
            Some(stored) => stored,
            None if create => {
                PairingSession::new(&key.tenant_id, &key.instance_name, self.deps.clock.now())
            }
            None => return Err(PairingError::SessionNotFound(key.to_string())),
        };

        // Retired actors leave closed handles behind.
        self.sessions.retain(|_, handle| !handle.is_closed());
        let handle = self
            .sessions
            .entry(key)
            .and_modify(|existing| {
                if existing.is_closed() {
                    *existing = SessionActorHandle::spawn(session.clone(), self.deps.clone());
                }
            })
            .or_insert_with(|| SessionActorHandle::spawn(session.clone(), self.deps.clone()))
            .value()
            .clone();
        Ok(handle)
    }

    async fn resume_context(&self, tenant_id: &str) -> Option<PairingContext> {
        let gateway = match self.resolver.gateway().await {
            Ok(gateway) => gateway,
            Err(e) => {
                warn!(
                    component = "manager",
                    event = "manager.resume_without_config",
                    tenant_id = %tenant_id,
                    error = %e,
                    "Gateway config unavailable for resumed session"
                );
                return None;
            }
        };
        let tenant = self.resolver.resolve(tenant_id).await.ok().map(|(_, t)| t);
        Some(PairingContext { gateway, tenant })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pairline_gateway::GatewayError;
    use pairline_protocol::{ErrorKind, PairingStatus};
    use tokio::time::sleep;

    use super::*;
    use crate::persistence::SessionStore;
    use crate::settings::{PairingConfig, QrRefreshPolicy};
    use crate::test_support::{harness, harness_with, Call, INITIAL_QR};
    use crate::transition::is_valid_edge;

    const INSTANCE: &str = "acme-live";

    async fn start(h: &crate::test_support::Harness) -> PairingSession {
        h.manager
            .start_pairing("t1", Some(INSTANCE.to_string()))
            .await
            .unwrap()
    }

    async fn current(h: &crate::test_support::Harness) -> PairingSession {
        h.manager
            .find_by_instance(INSTANCE)
            .unwrap()
            .get()
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn missing_phone_number_fails_before_any_gateway_call() {
        let h = harness();
        let err = h.manager.start_pairing("t2", None).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PhoneNumberMissing);
        assert!(h.gateway.calls().is_empty());
        assert!(h.store.list().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn embedded_qr_moves_straight_to_waiting_for_scan() {
        let h = harness();
        let session = start(&h).await;

        assert_eq!(session.status, PairingStatus::WaitingForScan);
        assert_eq!(session.qr_payload.as_deref(), Some(INITIAL_QR));
        assert!(session.qr_issued_at.is_some());
        assert_eq!(h.gateway.creates(), 1);
        assert_eq!(h.gateway.qr_fetches(), 0);

        // Poller and QR timer are both running.
        sleep(Duration::from_secs(31)).await;
        assert!(h.gateway.polls() >= 6);
        assert_eq!(h.gateway.qr_fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_embedded_qr_is_fetched_separately() {
        let h = harness();
        h.gateway.script_create(Ok(None));
        let session = start(&h).await;

        assert_eq!(session.qr_payload.as_deref(), Some("qr-1"));
        assert_eq!(h.gateway.qr_fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn starting_twice_does_not_create_a_second_instance() {
        let h = harness();
        let first = start(&h).await;
        let second = start(&h).await;

        assert_eq!(h.gateway.creates(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_share_one_instance() {
        let h = harness();
        let (a, b) = tokio::join!(
            h.manager.start_pairing("t1", None),
            h.manager.start_pairing("t1", None)
        );

        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert_eq!(h.gateway.creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn default_naming_reuses_the_tenants_live_session() {
        let h = harness();
        let explicit = start(&h).await;
        let reused = h.manager.start_pairing("t1", None).await.unwrap();

        assert_eq!(reused.instance_name, explicit.instance_name);
        assert_eq!(h.gateway.creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_on_third_poll_connects_and_stops_polling() {
        let h = harness();
        h.gateway.script_states(vec![
            Ok(ConnState::Connecting),
            Ok(ConnState::Connecting),
            Ok(ConnState::Open),
        ]);
        start(&h).await;

        sleep(Duration::from_secs(16)).await;
        let session = current(&h).await;
        assert_eq!(session.status, PairingStatus::Connected);
        assert!(session.connected_at.is_some());
        assert!(session.last_activity_at.is_some());
        assert!(session.qr_payload.is_none());
        assert_eq!(h.gateway.polls(), 3);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.gateway.polls(), 3);
        assert_eq!(h.gateway.qr_fetches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn one_qr_regeneration_after_thirty_one_seconds() {
        let h = harness();
        let started = start(&h).await;

        sleep(Duration::from_secs(31)).await;
        let session = current(&h).await;

        assert_eq!(h.gateway.qr_fetches(), 1);
        assert_ne!(session.qr_payload, started.qr_payload);
        assert_eq!(session.qr_payload.as_deref(), Some("qr-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn qr_issued_at_increases_until_the_session_leaves_waiting() {
        let h = harness();
        let mut last = start(&h).await.qr_issued_at.unwrap();

        // Refreshes land at t=30/60/90; sample just after each.
        sleep(Duration::from_secs(1)).await;
        for _ in 0..3 {
            sleep(Duration::from_secs(30)).await;
            let issued = current(&h).await.qr_issued_at.unwrap();
            assert!(issued > last);
            last = issued;
        }

        h.manager
            .observe_connection(INSTANCE, ConnState::Open, h.manager.deps.clock.now())
            .await
            .unwrap();
        let connected = current(&h).await;
        assert_eq!(connected.status, PairingStatus::Connected);

        let fetches = h.gateway.qr_fetches();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(h.gateway.qr_fetches(), fetches);
        assert_eq!(current(&h).await.qr_issued_at, connected.qr_issued_at);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_fails_with_pairing_timeout() {
        let h = harness();
        start(&h).await;

        sleep(Duration::from_secs(301)).await;
        let session = current(&h).await;
        assert_eq!(session.status, PairingStatus::Failed);
        let error = session.last_error.unwrap();
        assert_eq!(error.kind, ErrorKind::PairingTimeout);
        assert!(error.message.contains("300s"));

        let polls = h.gateway.polls();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.gateway.polls(), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_poll_errors_do_not_fail_the_session() {
        let h = harness();
        h.gateway.script_states(vec![
            Err(GatewayError::Unreachable("connection refused".into())),
            Err(GatewayError::Timeout(Duration::from_secs(15))),
            Ok(ConnState::Open),
        ]);
        start(&h).await;

        sleep(Duration::from_secs(11)).await;
        assert_eq!(current(&h).await.status, PairingStatus::WaitingForScan);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(current(&h).await.status, PairingStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_are_surfaced_when_the_budget_runs_out() {
        let h = harness();
        h.gateway.script_states(
            (0..60)
                .map(|_| Err(GatewayError::Unreachable("connection refused".into())))
                .collect(),
        );
        start(&h).await;

        sleep(Duration::from_secs(301)).await;
        let error = current(&h).await.last_error.unwrap();
        assert_eq!(error.kind, ErrorKind::PairingTimeout);
        assert!(error.message.contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn instance_vanishing_at_the_gateway_fails_the_session() {
        let h = harness();
        h.gateway.script_states(vec![Err(GatewayError::Rejected {
            status: 404,
            body: "not found".into(),
        })]);
        start(&h).await;

        sleep(Duration::from_secs(6)).await;
        let session = current(&h).await;
        assert_eq!(session.status, PairingStatus::Failed);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(h.gateway.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn webhook_open_wins_while_a_poll_is_in_flight() {
        let h = harness();
        h.gateway.delay_polls(Duration::from_secs(4));
        start(&h).await;

        // First poll starts at t=5 and would return at t=9.
        sleep(Duration::from_secs(6)).await;
        assert_eq!(h.gateway.polls(), 1);

        h.manager
            .observe_connection(INSTANCE, ConnState::Open, h.manager.deps.clock.now())
            .await
            .unwrap();
        let session = current(&h).await;
        assert_eq!(session.status, PairingStatus::Connected);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(current(&h).await.status, PairingStatus::Connected);
        assert_eq!(h.gateway.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn webhook_close_disconnects_a_connected_session() {
        let h = harness();
        start(&h).await;
        let clock = h.manager.deps.clock;

        h.manager
            .observe_connection(INSTANCE, ConnState::Open, clock.now())
            .await
            .unwrap();
        sleep(Duration::from_secs(1)).await;
        h.manager
            .observe_connection(INSTANCE, ConnState::Close, clock.now())
            .await
            .unwrap();

        assert_eq!(current(&h).await.status, PairingStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_resets_locally_even_when_logout_fails() {
        let h = harness();
        start(&h).await;
        h.manager
            .observe_connection(INSTANCE, ConnState::Open, h.manager.deps.clock.now())
            .await
            .unwrap();
        h.gateway.fail_disconnect();

        let err = h.manager.disconnect("t1", INSTANCE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisconnectFailed);

        let session = current(&h).await;
        assert_eq!(session.status, PairingStatus::Disconnected);
        assert!(session.qr_payload.is_none());
        assert_eq!(session.last_error.unwrap().kind, ErrorKind::DisconnectFailed);

        let calls = h.gateway.calls().len();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(h.gateway.calls().len(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_waiting_stops_timers() {
        let h = harness();
        start(&h).await;

        let session = h.manager.disconnect("t1", INSTANCE).await.unwrap();
        assert_eq!(session.status, PairingStatus::Disconnected);
        assert!(session.last_error.is_none());
        assert!(h
            .gateway
            .calls()
            .contains(&Call::Disconnect(INSTANCE.to_string())));

        sleep(Duration::from_secs(120)).await;
        assert_eq!(h.gateway.polls(), 0);
        assert_eq!(h.gateway.qr_fetches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_creation_fails_then_explicit_retry_recovers() {
        let h = harness();
        h.gateway.script_create(Err(GatewayError::Rejected {
            status: 500,
            body: "{\"error\":\"boom\"}".into(),
        }));

        let err = h
            .manager
            .start_pairing("t1", Some(INSTANCE.into()))
            .await
            .unwrap_err();
        match &err {
            PairingError::ProvisionFailed { status, body } => {
                assert_eq!(*status, Some(500));
                assert!(body.contains("boom"));
            }
            other => panic!("unexpected {:?}", other),
        }
        let failed = current(&h).await;
        assert_eq!(failed.status, PairingStatus::Failed);
        assert!(failed.last_error.is_some());

        let retried = start(&h).await;
        assert_eq!(retried.status, PairingStatus::WaitingForScan);
        assert!(retried.last_error.is_none());
        assert_eq!(retried.id, failed.id);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_gateway_during_creation_is_reported_as_such() {
        let h = harness();
        h.gateway
            .script_create(Err(GatewayError::Unreachable("dns failure".into())));

        let err = h
            .manager
            .start_pairing("t1", Some(INSTANCE.into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GatewayUnreachable);
        assert_eq!(current(&h).await.status, PairingStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn name_conflict_deletes_the_stale_instance_and_retries() {
        let h = harness();
        h.gateway.script_create(Err(GatewayError::Rejected {
            status: 403,
            body: "instance already exists".into(),
        }));

        let session = start(&h).await;
        assert_eq!(session.status, PairingStatus::WaitingForScan);
        assert_eq!(
            h.gateway.calls()[..3].to_vec(),
            vec![
                Call::Create(INSTANCE.into()),
                Call::Delete(INSTANCE.into()),
                Call::Create(INSTANCE.into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn recreate_policy_rebuilds_the_instance_for_each_qr() {
        let h = harness_with(PairingConfig {
            qr_policy: QrRefreshPolicy::RecreateInstance,
            ..PairingConfig::default()
        });
        h.gateway.script_create(Ok(Some(INITIAL_QR.into())));
        h.gateway.script_create(Ok(Some("data:image/png;base64,SECOND".into())));
        start(&h).await;

        sleep(Duration::from_secs(31)).await;
        let session = current(&h).await;
        assert_eq!(
            session.qr_payload.as_deref(),
            Some("data:image/png;base64,SECOND")
        );
        assert_eq!(h.gateway.creates(), 2);
        assert_eq!(h.gateway.count(|c| matches!(c, Call::Delete(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_refresh_requires_waiting_for_scan() {
        let h = harness();
        start(&h).await;

        let refreshed = h.manager.refresh_qr("t1", INSTANCE).await.unwrap();
        assert_eq!(refreshed.qr_payload.as_deref(), Some("qr-1"));

        h.manager.disconnect("t1", INSTANCE).await.unwrap();
        let err = h.manager.refresh_qr("t1", INSTANCE).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotWaitingForScan);
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_qr_replaces_the_current_code() {
        let h = harness();
        start(&h).await;
        sleep(Duration::from_secs(2)).await;

        h.manager
            .push_qr(INSTANCE, "data:image/png;base64,PUSHED".into())
            .await
            .unwrap();
        let session = current(&h).await;
        assert_eq!(
            session.qr_payload.as_deref(),
            Some("data:image/png;base64,PUSHED")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn newer_stored_status_is_adopted_before_the_next_transition() {
        let h = harness();
        let started = start(&h).await;

        let mut external = started.clone();
        external.status = PairingStatus::Connected;
        external.qr_payload = None;
        external.updated_at = started.updated_at + chrono::TimeDelta::hours(1);
        h.store.upsert(&external).await.unwrap();

        sleep(Duration::from_secs(6)).await;
        assert_eq!(current(&h).await.status, PairingStatus::Connected);
        assert_eq!(h.gateway.polls(), 1);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(h.gateway.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_instance_is_not_found() {
        let h = harness();
        let err = h
            .manager
            .observe_connection("ghost", ConnState::Open, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);

        let err = h.manager.disconnect("t1", "ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_deletes_the_row_and_announces_it() {
        let h = harness();
        start(&h).await;
        let mut events = h.manager.subscribe();

        h.manager.remove("t1", INSTANCE).await.unwrap();

        assert!(h.store.row("t1", INSTANCE).is_none());
        assert!(h.manager.find_by_instance(INSTANCE).is_none());
        loop {
            match events.recv().await.unwrap() {
                ServerMessage::SessionRemoved { instance_name, .. } => {
                    assert_eq!(instance_name, INSTANCE);
                    break;
                }
                _ => continue,
            }
        }

        let polls = h.gateway.polls();
        sleep(Duration::from_secs(30)).await;
        assert_eq!(h.gateway.polls(), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delete_leaves_the_session_pairing() {
        let h = harness();
        start(&h).await;
        h.store.fail_deletes(true);

        let err = h.manager.remove("t1", INSTANCE).await.unwrap_err();
        assert!(matches!(err, PairingError::Store(_)));
        assert_eq!(h.gateway.count(|c| matches!(c, Call::Disconnect(_))), 0);
        assert_eq!(current(&h).await.status, PairingStatus::WaitingForScan);
        assert!(h.store.row("t1", INSTANCE).is_some());

        let polls = h.gateway.polls();
        sleep(Duration::from_secs(30)).await;
        assert!(h.gateway.polls() > polls);

        sleep(Duration::from_secs(300)).await;
        let session = h.manager.session("t1", INSTANCE).await.unwrap();
        assert_eq!(session.status, PairingStatus::Failed);
        assert_eq!(session.last_error.unwrap().kind, ErrorKind::PairingTimeout);

        h.store.fail_deletes(false);
        h.manager.remove("t1", INSTANCE).await.unwrap();
        assert!(h.store.row("t1", INSTANCE).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_qr_restarts_the_refresh_timer() {
        let h = harness();
        start(&h).await;
        sleep(Duration::from_secs(20)).await;

        h.manager
            .push_qr(INSTANCE, "data:image/png;base64,PUSHED".into())
            .await
            .unwrap();

        sleep(Duration::from_secs(11)).await;
        assert_eq!(h.gateway.qr_fetches(), 0);
        assert_eq!(
            current(&h).await.qr_payload.as_deref(),
            Some("data:image/png;base64,PUSHED")
        );

        sleep(Duration::from_secs(20)).await;
        assert_eq!(h.gateway.qr_fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_actors_retire_and_respawn_from_the_store() {
        let h = harness_with(PairingConfig {
            idle_actor_timeout: Duration::from_secs(60),
            ..PairingConfig::default()
        });
        start(&h).await;
        h.manager.start_pairing("t1", Some("acme-second".into())).await.unwrap();
        h.manager.disconnect("t1", INSTANCE).await.unwrap();

        sleep(Duration::from_secs(61)).await;
        assert!(h.manager.find_by_instance(INSTANCE).is_none());
        assert!(h.manager.find_by_instance("acme-second").is_some());
        assert_eq!(
            h.manager.session("t1", INSTANCE).await.unwrap().status,
            PairingStatus::Disconnected
        );

        // Webhooks for a retired session still land.
        h.manager
            .observe_connection(INSTANCE, ConnState::Close, Utc::now())
            .await
            .unwrap();

        let restarted = start(&h).await;
        assert_eq!(restarted.status, PairingStatus::WaitingForScan);
        assert_eq!(h.gateway.creates(), 3);
        assert_eq!(h.manager.sessions.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn config_outage_uses_the_last_good_gateway_config() {
        let h = harness();
        h.source.set_failing(true);

        let err = h.manager.start_pairing("t1", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigMissing);
        assert!(h.gateway.calls().is_empty());

        h.source.set_failing(false);
        start(&h).await;

        h.source.set_failing(true);
        let refreshed = h.manager.refresh_qr("t1", INSTANCE).await.unwrap();
        assert_eq!(refreshed.status, PairingStatus::WaitingForScan);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_resumes_waiting_and_fails_interrupted_provisioning() {
        let h = harness();
        let now = Utc::now();

        let mut waiting = PairingSession::new("t1", "acme-waiting", now);
        waiting.status = PairingStatus::WaitingForScan;
        waiting.qr_payload = Some(INITIAL_QR.into());
        waiting.qr_issued_at = Some(now);
        h.store.upsert(&waiting).await.unwrap();

        let mut provisioning = PairingSession::new("t1", "acme-interrupted", now);
        provisioning.status = PairingStatus::Provisioning;
        h.store.upsert(&provisioning).await.unwrap();

        let mut connected = PairingSession::new("t1", "acme-linked", now);
        connected.status = PairingStatus::Connected;
        h.store.upsert(&connected).await.unwrap();

        assert_eq!(h.manager.recover().await.unwrap(), 3);

        let interrupted = h
            .manager
            .find_by_instance("acme-interrupted")
            .unwrap()
            .get()
            .await
            .unwrap();
        assert_eq!(interrupted.status, PairingStatus::Failed);
        assert!(interrupted
            .last_error
            .unwrap()
            .message
            .contains("interrupted by restart"));

        sleep(Duration::from_secs(6)).await;
        assert!(h
            .gateway
            .calls()
            .contains(&Call::State("acme-waiting".into())));
        assert!(!h
            .gateway
            .calls()
            .contains(&Call::State("acme-linked".into())));
        assert_eq!(
            h.manager.session("t1", "acme-linked").await.unwrap().status,
            PairingStatus::Connected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_every_scheduler() {
        let h = harness();
        start(&h).await;
        h.manager.start_pairing("t1", Some("acme-second".into())).await.unwrap();

        h.manager.shutdown().await;
        let calls = h.gateway.calls().len();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(h.gateway.calls().len(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_statuses_only_follow_lifecycle_edges() {
        let h = harness();
        let mut events = h.manager.subscribe();
        h.gateway.script_states(vec![Ok(ConnState::Connecting), Ok(ConnState::Open)]);
        start(&h).await;
        sleep(Duration::from_secs(11)).await;
        h.manager.disconnect("t1", INSTANCE).await.unwrap();

        let mut seen = vec![PairingStatus::Disconnected];
        while let Ok(msg) = events.try_recv() {
            if let ServerMessage::SessionUpdated { session } = msg {
                seen.push(session.status);
            }
        }
        for pair in seen.windows(2) {
            assert!(
                is_valid_edge(pair[0], pair[1]),
                "{:?} -> {:?}",
                pair[0],
                pair[1]
            );
        }
        assert_eq!(seen.last(), Some(&PairingStatus::Disconnected));
        assert!(seen.contains(&PairingStatus::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn list_includes_live_snapshots() {
        let h = harness();
        start(&h).await;
        let sessions = h.manager.list().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, PairingStatus::WaitingForScan);
    }
}
