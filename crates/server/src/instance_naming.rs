//! Gateway instance naming policy.

use chrono::{DateTime, Utc};

use crate::config_resolver::TenantContext;

const MAX_SLUG_CHARS: usize = 32;

/// Derives the gateway instance name for a tenant's pairing request.
pub trait InstanceNamer: Send + Sync {
    fn instance_name(&self, tenant: &TenantContext, now: DateTime<Utc>) -> String;
}

/// `<tenant-slug>-<YYYYMMDD>`, e.g. `acme-dental-20260314`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TenantDateNamer;

impl InstanceNamer for TenantDateNamer {
    fn instance_name(&self, tenant: &TenantContext, now: DateTime<Utc>) -> String {
        let slug = slugify(&tenant.tenant_name)
            .or_else(|| slugify(&tenant.tenant_id))
            .unwrap_or_else(|| "tenant".to_string());
        format!("{}-{}", slug, now.format("%Y%m%d"))
    }
}

fn slugify(value: &str) -> Option<String> {
    let mut out = String::new();
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }

    let mut slug: String = out.chars().take(MAX_SLUG_CHARS).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        None
    } else {
        Some(slug)
    }
}
