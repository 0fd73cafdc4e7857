//! `pairline set-gateway` / `pairline set-tenant`: write the config store.

use crate::config_resolver::{SqliteConfigSource, TenantRecord};
use crate::migration_runner;
use crate::paths;

fn open_source() -> anyhow::Result<SqliteConfigSource> {
    paths::ensure_dirs()?;
    let db_path = paths::db_path();
    migration_runner::open_and_migrate(&db_path)?;
    Ok(SqliteConfigSource::new(db_path))
}

pub fn set_gateway(url: &str, api_key: &str) -> anyhow::Result<()> {
    let url = url.trim().trim_end_matches('/');
    if url.is_empty() || api_key.trim().is_empty() {
        anyhow::bail!("gateway URL and API key must both be non-empty");
    }

    open_source()?.set_gateway(url, api_key)?;

    println!();
    println!("  Gateway set to {}", url);
    println!("  Restart a running server to pick up the new credentials.");
    println!();
    Ok(())
}

pub fn set_tenant(id: &str, name: &str, phone: Option<&str>) -> anyhow::Result<()> {
    let id = id.trim();
    if id.is_empty() {
        anyhow::bail!("tenant id must be non-empty");
    }
    let phone_number = phone
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    open_source()?.upsert_tenant(&TenantRecord {
        id: id.to_string(),
        name: name.trim().to_string(),
        phone_number: phone_number.clone(),
    })?;

    println!();
    println!("  Tenant {} saved ({})", id, name.trim());
    if phone_number.is_none() {
        println!("  No phone number: pairing for this tenant will be refused until one is set.");
    }
    println!();
    Ok(())
}
