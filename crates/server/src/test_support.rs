//! Scripted gateway and wiring shared by manager, webhook and API tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pairline_gateway::{
    CreateInstance, CreatedInstance, GatewayClient, GatewayError, GlobalGatewayConfig,
    InstanceHandle,
};
use pairline_protocol::ConnState;
use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::config_resolver::fixtures::StaticConfigSource;
use crate::config_resolver::ConfigResolver;
use crate::instance_naming::TenantDateNamer;
use crate::manager::PairingSessionManager;
use crate::persistence::memory::MemorySessionStore;
use crate::session_actor::ActorDeps;
use crate::settings::PairingConfig;

pub const INITIAL_QR: &str = "data:image/png;base64,INITIAL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(String),
    State(String),
    Qr(String),
    Disconnect(String),
    Delete(String),
}

/// In-process gateway that records every call and answers from scripts.
#[derive(Default)]
pub struct FakeGateway {
    calls: Mutex<Vec<Call>>,
    create_script: Mutex<VecDeque<Result<Option<String>, GatewayError>>>,
    state_script: Mutex<VecDeque<Result<ConnState, GatewayError>>>,
    qr_counter: AtomicUsize,
    disconnect_fails: AtomicBool,
    poll_delay: Mutex<Option<Duration>>,
}

impl FakeGateway {
    /// Next create answers with this embedded QR (`None` = no QR in the response).
    pub fn script_create(&self, result: Result<Option<String>, GatewayError>) {
        self.create_script.lock().unwrap().push_back(result);
    }

    /// Next connection-state polls answer in order; afterwards `connecting`.
    pub fn script_states(&self, states: Vec<Result<ConnState, GatewayError>>) {
        self.state_script.lock().unwrap().extend(states);
    }

    pub fn fail_disconnect(&self) {
        self.disconnect_fails.store(true, Ordering::SeqCst);
    }

    pub fn delay_polls(&self, delay: Duration) {
        *self.poll_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    pub fn creates(&self) -> usize {
        self.count(|c| matches!(c, Call::Create(_)))
    }

    pub fn polls(&self) -> usize {
        self.count(|c| matches!(c, Call::State(_)))
    }

    pub fn qr_fetches(&self) -> usize {
        self.count(|c| matches!(c, Call::Qr(_)))
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl GatewayClient for FakeGateway {
    async fn create_instance(
        &self,
        _cfg: &GlobalGatewayConfig,
        request: &CreateInstance,
        _deadline: Duration,
    ) -> Result<CreatedInstance, GatewayError> {
        self.record(Call::Create(request.instance_name.clone()));
        let scripted = self
            .create_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Some(INITIAL_QR.to_string())));
        scripted.map(|qr_payload| CreatedInstance {
            handle: InstanceHandle {
                instance_name: request.instance_name.clone(),
                status: Some("created".into()),
            },
            qr_payload,
        })
    }

    async fn connection_state(
        &self,
        _cfg: &GlobalGatewayConfig,
        instance_name: &str,
        _deadline: Duration,
    ) -> Result<ConnState, GatewayError> {
        self.record(Call::State(instance_name.to_string()));
        let delay = *self.poll_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(ConnState::Connecting))
    }

    async fn qr_code(
        &self,
        _cfg: &GlobalGatewayConfig,
        instance_name: &str,
        _deadline: Duration,
    ) -> Result<String, GatewayError> {
        self.record(Call::Qr(instance_name.to_string()));
        let n = self.qr_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("qr-{}", n))
    }

    async fn disconnect(
        &self,
        _cfg: &GlobalGatewayConfig,
        instance_name: &str,
        _deadline: Duration,
    ) -> Result<(), GatewayError> {
        self.record(Call::Disconnect(instance_name.to_string()));
        if self.disconnect_fails.load(Ordering::SeqCst) {
            return Err(GatewayError::Rejected {
                status: 500,
                body: "logout exploded".into(),
            });
        }
        Ok(())
    }

    async fn delete_instance(
        &self,
        _cfg: &GlobalGatewayConfig,
        instance_name: &str,
        _deadline: Duration,
    ) -> Result<(), GatewayError> {
        self.record(Call::Delete(instance_name.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub manager: Arc<PairingSessionManager>,
    pub gateway: Arc<FakeGateway>,
    pub store: Arc<MemorySessionStore>,
    pub source: Arc<StaticConfigSource>,
}

pub fn gateway_config() -> GlobalGatewayConfig {
    GlobalGatewayConfig::new("http://gateway.local", "master-key")
}

pub fn harness() -> Harness {
    harness_with(PairingConfig::default())
}

/// Tenant `t1` ("Acme") has a phone number; `t2` ("Bare") does not.
pub fn harness_with(settings: PairingConfig) -> Harness {
    let gateway = Arc::new(FakeGateway::default());
    let store = Arc::new(MemorySessionStore::default());
    let source = Arc::new(StaticConfigSource::with_gateway(gateway_config()));
    source.add_tenant("t1", "Acme", Some("+1 555 0100"));
    source.add_tenant("t2", "Bare", None);

    let (events, _) = broadcast::channel(256);
    let deps = ActorDeps {
        gateway: gateway.clone(),
        store: store.clone(),
        settings: Arc::new(settings),
        clock: Clock::new(),
        events,
    };
    let resolver = Arc::new(ConfigResolver::new(source.clone(), None));
    let manager = Arc::new(PairingSessionManager::new(
        resolver,
        Arc::new(TenantDateNamer),
        deps,
    ));

    Harness {
        manager,
        gateway,
        store,
        source,
    }
}
