//! The host pool and the in-process index of observed levels.
//!
//! The index maps an instance id to its observed level and the index of
//! the owning host; drivers live in their own list so an entry never
//! owns its host. The index is authoritative for placement inside the
//! process but may lag actual host state; it is rebuilt on load and
//! repaired by the reconciler on the next pass.

use std::collections::HashMap;

use rand::Rng;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::host::HostDriver;
use crate::types::{Level, LevelId, LevelType};

#[derive(Debug)]
struct IndexEntry {
    level: Level,
    host: usize,
}

/// Set of host drivers plus the observed-instance index
#[derive(Debug)]
pub struct Pool {
    hosts: Vec<HostDriver>,
    index: HashMap<LevelId, IndexEntry>,
}

impl Pool {
    /// Create a pool over the given drivers
    pub fn new(hosts: Vec<HostDriver>) -> Result<Self> {
        if hosts.is_empty() {
            return Err(Error::invalid_config("host pool is empty"));
        }
        Ok(Self {
            hosts,
            index: HashMap::new(),
        })
    }

    /// Number of hosts in the pool
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Bring up the ingress proxy on every host (best-effort)
    pub async fn bootstrap_ingress(&self) {
        for host in &self.hosts {
            host.ensure_ingress().await;
        }
    }

    /// Rebuild the index from what is actually running on the hosts.
    ///
    /// Called once at startup.
    pub async fn load(&mut self) {
        for (idx, host) in self.hosts.iter().enumerate() {
            let ids = match host.list_running_ids().await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(host = %host.host().display, error = %err, "cannot list running levels");
                    continue;
                }
            };
            for id in ids {
                let level = host.inspect(&id).await;
                self.index.insert(id, IndexEntry { level, host: idx });
            }
        }
        info!(levels = self.index.len(), hosts = self.hosts.len(), "observed index loaded");
    }

    fn pick(&self) -> usize {
        rand::rng().random_range(0..self.hosts.len())
    }

    /// Observed level for an instance, if any
    #[must_use]
    pub fn get(&self, id: &LevelId) -> Option<&Level> {
        self.index.get(id).map(|entry| &entry.level)
    }

    /// Provision an instance on a randomly picked host and index the
    /// resulting observation
    pub async fn create(&mut self, id: &LevelId, tarball_url: &str) -> Result<Level> {
        let picked = self.pick();
        let host = &self.hosts[picked];
        info!(host = %host.host().display, %id, url = %tarball_url, "creating level");
        host.create(id, tarball_url).await?;
        let level = host.inspect(id).await;
        self.index.insert(
            id.clone(),
            IndexEntry {
                level: level.clone(),
                host: picked,
            },
        );
        Ok(level)
    }

    /// Tear down an instance on its owning host and drop it from the
    /// index; a no-op for unknown ids
    pub async fn destroy(&mut self, id: &LevelId) {
        if let Some(entry) = self.index.remove(id) {
            let host = &self.hosts[entry.host];
            info!(host = %host.host().display, %id, "destroying level");
            host.destroy(id).await;
        }
    }

    /// Tear down an instance on every host.
    ///
    /// Recovery path for when the index is suspected stale (operator
    /// interventions, force-redump).
    pub async fn destroy_blind(&mut self, id: &LevelId) {
        info!(%id, "destroying level on every host");
        for host in &self.hosts {
            host.destroy(id).await;
        }
        self.index.remove(id);
    }

    /// Level type of an instance, asked of the owning host when the id
    /// is indexed and of an arbitrary host otherwise
    pub async fn level_type(&self, id: &LevelId) -> Result<LevelType> {
        let idx = self
            .index
            .get(id)
            .map_or_else(|| self.pick(), |entry| entry.host);
        self.hosts[idx].level_type(id).await
    }
}
