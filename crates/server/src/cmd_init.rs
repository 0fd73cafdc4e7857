//! `pairline init`: bootstrap a fresh machine.
//!
//! Creates the data dir structure, runs migrations, and prints next steps.

use std::path::Path;

use crate::config_resolver::SqliteConfigSource;
use crate::migration_runner;
use crate::paths;

pub fn run(data_dir: &Path) -> anyhow::Result<()> {
    println!();

    paths::ensure_dirs()?;
    println!("  Created {}/", data_dir.display());

    let db_path = paths::db_path();
    migration_runner::open_and_migrate(&db_path)?;
    println!("  Database initialized at {}", db_path.display());

    let has_gateway = SqliteConfigSource::new(&db_path)
        .gateway_blocking()?
        .is_some_and(|cfg| cfg.is_complete());

    println!();
    println!("  Next steps:");
    if !has_gateway {
        println!("    1. Point at your gateway:  pairline set-gateway --url <URL> --api-key <KEY>");
    } else {
        println!("    1. Gateway: configured");
    }
    println!("    2. Register a tenant:      pairline set-tenant --id <ID> --name <NAME> --phone <PHONE>");
    println!("    3. Start the server:       pairline start --webhook-url <PUBLIC_URL>/webhook/gateway");
    println!("       With --auth-token, the token is appended to the webhook URL for you.");
    println!();

    Ok(())
}
