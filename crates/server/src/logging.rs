//! Structured logging to `<data_dir>/logs/server.log`, optionally mirrored to stderr.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE: &str = "server.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

/// Keeps the background writer alive; drop it only at process exit.
pub struct LoggingHandle {
    pub run_id: String,
    _guard: WorkerGuard,
}

/// First valid directive wins: `PAIRLINE_LOG_FILTER`, then `RUST_LOG`, then the default.
fn resolve_filter(candidates: &[Option<String>]) -> (EnvFilter, String) {
    candidates
        .iter()
        .flatten()
        .find_map(|directive| {
            EnvFilter::try_new(directive)
                .ok()
                .map(|filter| (filter, directive.clone()))
        })
        .unwrap_or_else(|| (EnvFilter::new(DEFAULT_FILTER), DEFAULT_FILTER.to_string()))
}

pub fn init_logging(log_dir: &Path, mirror_stderr: bool) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE);

    if std::env::var("PAIRLINE_TRUNCATE_LOG_ON_START").as_deref() == Ok("1") {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
    }

    let (filter, filter_source) = resolve_filter(&[
        std::env::var("PAIRLINE_LOG_FILTER").ok(),
        std::env::var("RUST_LOG").ok(),
    ]);
    let format = LogFormat::parse(std::env::var("PAIRLINE_LOG_FORMAT").ok().as_deref());

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, LOG_FILE));
    let file_layer = match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .with_writer(writer)
            .json()
            .flatten_event(true)
            .with_file(true)
            .with_line_number(true)
            .with_current_span(true)
            .boxed(),
    };
    let stderr_layer = mirror_stderr.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    let run_id = std::env::var("PAIRLINE_RUN_ID").unwrap_or_else(|_| {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("pid-{}-{}", std::process::id(), millis)
    });

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %run_id,
        log_path = %log_path.display(),
        format = format.as_str(),
        filter = %filter_source,
        stderr = mirror_stderr,
    );

    Ok(LoggingHandle {
        run_id,
        _guard: guard,
    })
}
