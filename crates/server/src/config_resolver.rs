//! Gateway credential and tenant resolution.
//!
//! The primary source is the local SQLite config store. The last good gateway
//! config is kept in memory and mirrored to `gateway-cache.json`, so a
//! temporarily unreadable primary still resolves.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use pairline_gateway::GlobalGatewayConfig;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PairingError;
use crate::persistence::{self, StoreError};

const BASE_URL_KEY: &str = "gateway.base_url";
const API_KEY_KEY: &str = "gateway.master_api_key";

/// Everything the manager needs to know about a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: String,
    pub tenant_name: String,
    pub tenant_phone_number: String,
}

/// Tenant row as stored; the phone number may be absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantRecord {
    pub id: String,
    pub name: String,
    pub phone_number: Option<String>,
}

/// Read side of the tenant/config store.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn gateway_config(&self) -> Result<Option<GlobalGatewayConfig>, StoreError>;
    async fn tenant(&self, tenant_id: &str) -> Result<Option<TenantRecord>, StoreError>;
}

/// Config store backed by the `gateway_settings` and `tenants` tables.
#[derive(Debug, Clone)]
pub struct SqliteConfigSource {
    db_path: PathBuf,
}

impl SqliteConfigSource {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn set_gateway(&self, base_url: &str, master_api_key: &str) -> Result<(), StoreError> {
        let conn = persistence::open(&self.db_path)?;
        for (key, value) in [(BASE_URL_KEY, base_url), (API_KEY_KEY, master_api_key)] {
            conn.execute(
                "INSERT INTO gateway_settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![key, value.trim()],
            )?;
        }
        Ok(())
    }

    pub fn upsert_tenant(&self, tenant: &TenantRecord) -> Result<(), StoreError> {
        let conn = persistence::open(&self.db_path)?;
        conn.execute(
            "INSERT INTO tenants (id, name, phone_number) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = ?2, phone_number = ?3",
            params![tenant.id, tenant.name, tenant.phone_number],
        )?;
        Ok(())
    }

    pub fn gateway_blocking(&self) -> Result<Option<GlobalGatewayConfig>, StoreError> {
        Self::read_gateway(&self.db_path)
    }

    fn read_gateway(db_path: &Path) -> Result<Option<GlobalGatewayConfig>, StoreError> {
        let conn = persistence::open(db_path)?;
        let read = |key: &str| -> Result<Option<String>, StoreError> {
            Ok(conn
                .query_row(
                    "SELECT value FROM gateway_settings WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        };
        match (read(BASE_URL_KEY)?, read(API_KEY_KEY)?) {
            (Some(base_url), Some(api_key)) => Ok(Some(GlobalGatewayConfig::new(base_url, api_key))),
            _ => Ok(None),
        }
    }

    fn read_tenant(db_path: &Path, tenant_id: &str) -> Result<Option<TenantRecord>, StoreError> {
        let conn = persistence::open(db_path)?;
        Ok(conn
            .query_row(
                "SELECT id, name, phone_number FROM tenants WHERE id = ?1",
                params![tenant_id],
                |row| {
                    Ok(TenantRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        phone_number: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }
}

#[async_trait]
impl ConfigSource for SqliteConfigSource {
    async fn gateway_config(&self) -> Result<Option<GlobalGatewayConfig>, StoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || Self::read_gateway(&db_path)).await?
    }

    async fn tenant(&self, tenant_id: &str) -> Result<Option<TenantRecord>, StoreError> {
        let db_path = self.db_path.clone();
        let tenant_id = tenant_id.to_string();
        tokio::task::spawn_blocking(move || Self::read_tenant(&db_path, &tenant_id)).await?
    }
}

/// On-disk mirror of the last good gateway config.
#[derive(Serialize, Deserialize)]
struct CachedGateway {
    base_url: String,
    master_api_key: String,
}

pub struct ConfigResolver {
    source: Arc<dyn ConfigSource>,
    cache: ArcSwapOption<GlobalGatewayConfig>,
    cache_path: Option<PathBuf>,
}

impl ConfigResolver {
    pub fn new(source: Arc<dyn ConfigSource>, cache_path: Option<PathBuf>) -> Self {
        Self {
            source,
            cache: ArcSwapOption::empty(),
            cache_path,
        }
    }

    /// Credentials plus tenant context for a pairing attempt.
    ///
    /// Fails before any gateway traffic with `ConfigMissing`,
    /// `TenantNotFound` or `PhoneNumberMissing`.
    pub async fn resolve(
        &self,
        tenant_id: &str,
    ) -> Result<(GlobalGatewayConfig, TenantContext), PairingError> {
        let gateway = self.gateway().await?;

        let tenant = self
            .source
            .tenant(tenant_id)
            .await?
            .ok_or_else(|| PairingError::TenantNotFound {
                tenant_id: tenant_id.to_string(),
            })?;

        let phone = tenant
            .phone_number
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| PairingError::PhoneNumberMissing {
                tenant_id: tenant_id.to_string(),
            })?;

        Ok((
            gateway,
            TenantContext {
                tenant_id: tenant.id,
                tenant_name: tenant.name,
                tenant_phone_number: phone,
            },
        ))
    }

    /// Gateway credentials alone, for operations on an existing instance.
    pub async fn gateway(&self) -> Result<GlobalGatewayConfig, PairingError> {
        match self.source.gateway_config().await {
            Ok(Some(cfg)) if cfg.is_complete() => {
                self.remember(&cfg);
                return Ok(cfg);
            }
            Ok(_) => {
                debug!(
                    component = "config",
                    event = "config.primary_incomplete",
                    "Gateway config incomplete in primary store, trying cache"
                );
            }
            Err(e) => {
                warn!(
                    component = "config",
                    event = "config.primary_failed",
                    error = %e,
                    "Gateway config lookup failed, falling back to cache"
                );
            }
        }

        if let Some(cfg) = self.cache.load_full() {
            debug!(
                component = "config",
                event = "config.cache_hit",
                source = "memory",
                "Using cached gateway config"
            );
            return Ok((*cfg).clone());
        }

        if let Some(cfg) = self.load_disk_cache() {
            warn!(
                component = "config",
                event = "config.cache_hit",
                source = "disk",
                "Using gateway config from disk cache"
            );
            self.cache.store(Some(Arc::new(cfg.clone())));
            return Ok(cfg);
        }

        Err(PairingError::ConfigMissing(
            "gateway base URL and master API key must both be set".to_string(),
        ))
    }

    fn remember(&self, cfg: &GlobalGatewayConfig) {
        let unchanged = self
            .cache
            .load()
            .as_deref()
            .is_some_and(|cached| cached == cfg);
        if unchanged {
            return;
        }
        self.cache.store(Some(Arc::new(cfg.clone())));

        let Some(path) = &self.cache_path else {
            return;
        };
        if let Err(e) = write_disk_cache(path, cfg) {
            warn!(
                component = "config",
                event = "config.cache_write_failed",
                path = %path.display(),
                error = %e,
                "Failed to write gateway cache"
            );
        }
    }

    fn load_disk_cache(&self) -> Option<GlobalGatewayConfig> {
        let path = self.cache_path.as_ref()?;
        let raw = std::fs::read_to_string(path).ok()?;
        let cached: CachedGateway = serde_json::from_str(&raw).ok()?;
        let cfg = GlobalGatewayConfig::new(cached.base_url, cached.master_api_key);
        cfg.is_complete().then_some(cfg)
    }
}

fn write_disk_cache(path: &Path, cfg: &GlobalGatewayConfig) -> anyhow::Result<()> {
    let body = serde_json::to_string(&CachedGateway {
        base_url: cfg.base_url.clone(),
        master_api_key: cfg.master_api_key.clone(),
    })?;
    std::fs::write(path, body)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
