//! Tenant client registry
//!
//! Maps a tenant key (doctor profile) to a shared [`CozeClient`]. Clients
//! are built lazily on first use and cached for the life of the process,
//! until [`TenantRegistry::invalidate_all`] drops them so rotated
//! credentials are picked up on the next request.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{DEFAULT_TENANT_KEY, TenantConfig};
use crate::error::{RelayError, Result};
use crate::upstream::{CozeClient, TenantSettings};

/// Public description of a configured tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantSummary {
    pub id: String,
    pub name: String,
    pub specialty: String,
    pub description: String,
}

#[derive(Debug)]
struct TenantTable {
    default_key: String,
    profiles: BTreeMap<String, TenantConfig>,
}

#[derive(Debug)]
pub struct TenantRegistry {
    table: RwLock<TenantTable>,
    clients: DashMap<String, Arc<CozeClient>>,
}

impl TenantRegistry {
    pub fn new(default_key: impl Into<String>, profiles: BTreeMap<String, TenantConfig>) -> Self {
        Self {
            table: RwLock::new(TenantTable {
                default_key: default_key.into(),
                profiles,
            }),
            clients: DashMap::new(),
        }
    }

    /// Key used for a request naming `tenant`
    pub fn key_for(&self, tenant: Option<&str>) -> String {
        match tenant.map(str::trim).filter(|t| !t.is_empty()) {
            Some(key) if key != DEFAULT_TENANT_KEY => key.to_string(),
            _ => self.read_table(|t| t.default_key.clone()),
        }
    }

    /// Client for `tenant`, building it on first use
    ///
    /// Construction happens while the map entry is locked, so concurrent
    /// first requests for one key all receive the same instance.
    pub fn resolve(&self, tenant: Option<&str>) -> Result<Arc<CozeClient>> {
        let key = self.key_for(tenant);

        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        match self.clients.entry(key) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let key = entry.key().clone();
                let profile = self
                    .read_table(|t| t.profiles.get(&key).cloned())
                    .ok_or_else(|| RelayError::Config(format!("unknown tenant '{key}'")))?;

                let client = Arc::new(CozeClient::new(TenantSettings::resolve(&key, &profile)?)?);
                info!(tenant = %key, "Registered upstream client");
                entry.insert(client.clone());
                Ok(client)
            }
        }
    }

    /// Drop every cached client; the next request rebuilds lazily
    pub fn invalidate_all(&self) {
        let dropped = self.clients.len();
        self.clients.clear();
        info!(dropped, "Invalidated tenant clients");
    }

    /// Swap in a new tenant table and invalidate every cached client
    pub fn replace_tenants(&self, default_key: String, profiles: BTreeMap<String, TenantConfig>) {
        {
            let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
            table.default_key = default_key;
            table.profiles = profiles;
        }
        // the table lock must be released before touching the client map
        self.invalidate_all();
    }

    /// Number of clients currently built
    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn default_key(&self) -> String {
        self.read_table(|t| t.default_key.clone())
    }

    /// Every configured tenant, sorted by key
    pub fn summaries(&self) -> Vec<TenantSummary> {
        self.read_table(|t| {
            t.profiles
                .iter()
                .map(|(key, profile)| TenantSummary {
                    id: key.clone(),
                    name: profile.name.clone().unwrap_or_else(|| key.clone()),
                    specialty: profile.specialty.clone().unwrap_or_default(),
                    description: profile.description.clone().unwrap_or_default(),
                })
                .collect()
        })
    }

    fn read_table<T>(&self, f: impl FnOnce(&TenantTable) -> T) -> T {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        f(&table)
    }
}
