//! Pairline Server
//!
//! Links messaging-gateway instances to a tenant's device by QR pairing.
//! Provides the pairing API, the gateway webhook, and a live status stream.

mod api;
mod auth;
mod clock;
mod cmd_config;
mod cmd_init;
mod cmd_qr;
mod cmd_status;
mod config_resolver;
mod error;
mod instance_naming;
mod logging;
mod manager;
mod migration_runner;
mod paths;
mod persistence;
mod provisioning;
mod scheduler;
mod session_actor;
mod session_command;
mod settings;
mod state;
mod transition;
mod webhook;
mod websocket;

#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use pairline_gateway::EvolutionClient;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config_resolver::{ConfigResolver, SqliteConfigSource};
use crate::instance_naming::TenantDateNamer;
use crate::manager::PairingSessionManager;
use crate::persistence::SqliteSessionStore;
use crate::session_actor::ActorDeps;
use crate::settings::{PairingConfig, QrRefreshPolicy};
use crate::state::AppState;
use crate::webhook::WebhookEventIngester;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Status events buffered per subscriber before it is reported as lagged.
const EVENT_BUFFER: usize = 1024;

#[derive(Parser)]
#[command(name = "pairline", version = VERSION, about = "Device pairing session manager")]
struct Cli {
    /// Data directory (default: ~/.pairline)
    #[arg(long, global = true, env = "PAIRLINE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pairing server
    Start(StartArgs),
    /// Create the data directory and database
    Init,
    /// Show whether the server is running and list sessions
    Status {
        /// Address the server listens on
        #[arg(long, default_value = "127.0.0.1:4100")]
        bind: SocketAddr,
    },
    /// Generate a random API auth token
    GenerateToken,
    /// Store the gateway base URL and master API key
    SetGateway {
        #[arg(long)]
        url: String,
        #[arg(long)]
        api_key: String,
    },
    /// Create or update a tenant
    SetTenant {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: Option<String>,
    },
    /// Print a session's pairing code as a terminal QR
    Qr {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        instance: String,
    },
}

#[derive(clap::Args)]
struct StartArgs {
    /// Address to bind
    #[arg(long, env = "PAIRLINE_BIND", default_value = "127.0.0.1:4100")]
    bind: SocketAddr,

    /// Require this bearer token on the API and WebSocket
    #[arg(long, env = "PAIRLINE_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Callback URL registered with the gateway for instance events
    #[arg(long, env = "PAIRLINE_WEBHOOK_URL")]
    webhook_url: Option<String>,

    #[arg(long, env = "PAIRLINE_QR_REFRESH_SECS", default_value_t = 30)]
    qr_refresh_secs: u64,

    #[arg(long, env = "PAIRLINE_POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval_secs: u64,

    /// Time a device has to link before the session fails
    #[arg(long, env = "PAIRLINE_PAIRING_TIMEOUT_SECS", default_value_t = 300)]
    pairing_timeout_secs: u64,

    /// Deadline for each gateway call
    #[arg(long, env = "PAIRLINE_HTTP_TIMEOUT_SECS", default_value_t = 15)]
    http_timeout_secs: u64,

    /// Re-create the gateway instance instead of fetching a new code on each QR refresh
    #[arg(long, env = "PAIRLINE_RECREATE_INSTANCE_PER_QR")]
    recreate_instance_per_qr: bool,

    /// Mirror logs to stderr
    #[arg(long)]
    log_stderr: bool,
}

impl StartArgs {
    fn pairing_config(&self) -> anyhow::Result<PairingConfig> {
        let webhook_url = match &self.webhook_url {
            Some(url) => Some(settings::webhook_url_with_token(
                url,
                self.auth_token.as_deref(),
            )?),
            None => None,
        };
        Ok(PairingConfig {
            qr_refresh_interval: Duration::from_secs(self.qr_refresh_secs.max(1)),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            pairing_timeout: Duration::from_secs(self.pairing_timeout_secs.max(1)),
            call_deadline: Duration::from_secs(self.http_timeout_secs.max(1)),
            qr_policy: if self.recreate_instance_per_qr {
                QrRefreshPolicy::RecreateInstance
            } else {
                QrRefreshPolicy::FetchQr
            },
            webhook_url,
            ..PairingConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());

    match cli.command {
        Command::Start(args) => run_server(args).await,
        Command::Init => cmd_init::run(&data_dir),
        Command::Status { bind } => cmd_status::run(&data_dir, bind).await,
        Command::GenerateToken => cmd_status::generate_token(&data_dir),
        Command::SetGateway { url, api_key } => cmd_config::set_gateway(&url, &api_key),
        Command::SetTenant { id, name, phone } => {
            cmd_config::set_tenant(&id, &name, phone.as_deref())
        }
        Command::Qr { tenant, instance } => cmd_qr::run(&tenant, &instance),
    }
}

async fn run_server(args: StartArgs) -> anyhow::Result<()> {
    paths::ensure_dirs()?;
    let logging = logging::init_logging(&paths::log_dir(), args.log_stderr)?;

    let bind = args.bind;
    info!(
        component = "server",
        event = "server.starting",
        version = VERSION,
        run_id = %logging.run_id,
        bind = %bind,
        data_dir = %paths::data_dir().display(),
        "Starting Pairline server"
    );

    let db_path = paths::db_path();
    migration_runner::open_and_migrate(&db_path)?;

    let settings = Arc::new(args.pairing_config()?);
    if settings.webhook_url.is_none() {
        warn!(
            component = "server",
            event = "server.webhook_unset",
            "No webhook URL configured; connection changes are detected by polling only"
        );
    }

    let source = Arc::new(SqliteConfigSource::new(&db_path));
    let resolver = Arc::new(ConfigResolver::new(
        source,
        Some(paths::gateway_cache_path()),
    ));
    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let clock = Clock::new();
    let deps = ActorDeps {
        gateway: Arc::new(EvolutionClient::new()),
        store: Arc::new(SqliteSessionStore::new(&db_path)),
        settings,
        clock,
        events,
    };
    let manager = Arc::new(PairingSessionManager::new(
        resolver,
        Arc::new(TenantDateNamer),
        deps,
    ));

    match manager.recover().await {
        Ok(count) => info!(
            component = "server",
            event = "server.recovered",
            sessions = count,
            "Restored persisted sessions"
        ),
        Err(e) => error!(
            component = "server",
            event = "server.recover_failed",
            error = %e,
            "Failed to restore persisted sessions"
        ),
    }

    let ingester = Arc::new(WebhookEventIngester::new(manager.clone(), clock));
    let state = Arc::new(AppState::new(
        manager.clone(),
        ingester,
        args.auth_token.clone(),
    ));
    let app = api::router(state, args.auth_token);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    let pid_path = paths::pid_file_path();
    std::fs::write(&pid_path, std::process::id().to_string())?;
    info!(
        component = "server",
        event = "server.listening",
        bind = %bind,
        "Listening"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    manager.shutdown().await;
    let _ = std::fs::remove_file(&pid_path);
    info!(
        component = "server",
        event = "server.stopped",
        "Server stopped"
    );

    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(
            component = "server",
            event = "server.signal_failed",
            error = %e,
            "Failed to listen for ctrl-c"
        );
        std::future::pending::<()>().await;
    }
    info!(
        component = "server",
        event = "server.shutdown_requested",
        "Shutdown requested"
    );
}
