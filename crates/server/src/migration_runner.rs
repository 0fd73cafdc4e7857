//! Lightweight migration runner for rusqlite.
//!
//! Migrations are numbered SQL files under `migrations/`, embedded at build
//! time. Applied versions are tracked in `schema_versions` and pending ones
//! run in order at startup.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::{info, warn};

/// (version, name, sql)
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "001_pairing_sessions",
        include_str!("../../../migrations/001_pairing_sessions.sql"),
    ),
    (
        2,
        "002_tenant_config",
        include_str!("../../../migrations/002_tenant_config.sql"),
    ),
];

/// Run all pending migrations against the given connection.
///
/// Call this at startup before any other database operations.
pub fn run_migrations(conn: &mut Connection) -> anyhow::Result<()> {
    // Set pragmas for safe concurrent access
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    // Ensure tracking table exists
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;

    // Get already-applied versions
    let applied: HashSet<i64> = conn
        .prepare("SELECT version FROM schema_versions")?
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    let mut pending = 0;
    for (version, name, sql) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }

        let tx = conn.transaction()?;
        if let Err(e) = tx.execute_batch(sql) {
            warn!(
                component = "migrations",
                event = "migration.failed",
                version = version,
                name = %name,
                error = %e,
                "Migration failed"
            );
            return Err(e.into());
        }
        tx.execute(
            "INSERT OR IGNORE INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![version, name],
        )?;
        tx.commit()?;

        info!(
            component = "migrations",
            event = "migration.applied",
            version = version,
            name = %name,
            "Applied migration"
        );
        pending += 1;
    }

    let total = MIGRATIONS.len();
    info!(
        component = "migrations",
        event = "migrations.complete",
        total = total,
        applied = pending,
        skipped = total - pending,
        "Migration check complete"
    );

    Ok(())
}

/// Open (creating if needed) the database at `path` and bring it up to date.
pub fn open_and_migrate(path: &std::path::Path) -> anyhow::Result<()> {
    let mut conn = Connection::open(path)?;
    run_migrations(&mut conn)
}
