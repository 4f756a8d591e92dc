use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper::{self, PurgePolicy};

/// One engine per tenant, keyed by the pgwire database name. Each tenant has
/// its own WAL file, compactor and (optionally) unpaid-booking purger.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    purge: Option<PurgePolicy>,
}

/// The tenant name doubles as the WAL file stem, so it must already be a
/// safe file name. Names are never rewritten: two names mapping to one file
/// would share a log.
fn wal_file_stem(tenant: &str) -> io::Result<&str> {
    if tenant.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    if !tenant
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid tenant name {tenant:?}: only ASCII letters, digits, '_' and '-' are allowed"),
        ));
    }
    Ok(tenant)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, purge: Option<PurgePolicy>) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            purge,
        }
    }

    /// Return the tenant's engine, replaying its WAL on first access.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let stem = wal_file_stem(tenant)?;

        // The entry lock makes concurrent first connections share one engine.
        let engines_len = self.engines.len();
        let entry = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => v,
        };
        if engines_len >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        let wal_path = self.data_dir.join(format!("{stem}.wal"));
        let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);

        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));
        if let Some(policy) = self.purge {
            tokio::spawn(reaper::run_purger(engine.clone(), policy));
        }

        entry.insert(engine.clone());
        info!(tenant, listings = engine.state.len(), "tenant loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
