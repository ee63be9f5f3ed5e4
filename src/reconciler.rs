//! The reconcile loop: diff desired against observed state and converge.
//!
//! One sequential pass per tick; per-instance failures are logged,
//! forwarded to the error sink and skipped, so a broken instance never
//! halts the loop. Retries are implicit in the next pass.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::inventory::{DesiredInstance, InventoryClient};
use crate::pool::Pool;
use crate::types::{tarball_fingerprint, Level, LevelId};

/// Decision for one desired instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Inactive or without a tarball URL: leave alone
    Ignore,
    /// Not observed anywhere: provision
    Create,
    /// Observed but stale: tear down and provision again
    Redump,
    /// Observed and fresh: nothing to do
    Noop,
}

/// Decide what to do for one instance given its observed state.
///
/// A redump triggers when the materialized source fingerprint no longer
/// matches the desired URL, or when the stack's age reaches the
/// configured redump interval (boundary included).
pub fn decide(desired: &DesiredInstance, observed: Option<&Level>, now: DateTime<Utc>) -> Action {
    let Some(url) = desired.tarball_url.as_deref() else {
        return Action::Ignore;
    };
    if !desired.active {
        return Action::Ignore;
    }
    let Some(level) = observed else {
        return Action::Create;
    };
    if level.source.as_deref() != Some(tarball_fingerprint(url).as_str()) {
        return Action::Redump;
    }
    if let (Some(dumped_at), Some(redump)) = (level.dumped_at, desired.redump_seconds) {
        if now >= dumped_at + chrono::Duration::seconds(redump) {
            return Action::Redump;
        }
    }
    Action::Noop
}

/// Periodic reconciliation of the desired inventory against the pool
pub struct Reconciler {
    pool: Pool,
    inventory: InventoryClient,
    refresh_rate: Duration,
}

impl Reconciler {
    /// Create a reconciler over a loaded pool
    pub fn new(pool: Pool, inventory: InventoryClient, refresh_rate: Duration) -> Self {
        Self {
            pool,
            inventory,
            refresh_rate,
        }
    }

    /// Run reconcile passes forever
    pub async fn run(&mut self) -> Result<()> {
        loop {
            self.pass().await;
            tokio::time::sleep(self.refresh_rate).await;
        }
    }

    /// One reconcile pass over the whole desired set
    pub async fn pass(&mut self) {
        let desired = match self.inventory.fetch_desired().await {
            Ok(desired) => desired,
            Err(err) => {
                report(&err);
                warn!(error = %err, "cannot fetch desired instances, skipping pass");
                return;
            }
        };
        debug!(count = desired.len(), "reconcile pass");
        for instance in &desired {
            if let Err(err) = self.apply(instance).await {
                report(&err);
                warn!(id = %instance.id, error = %err, "instance reconciliation failed");
            }
        }
    }

    async fn apply(&mut self, instance: &DesiredInstance) -> Result<()> {
        match decide(instance, self.pool.get(&instance.id), Utc::now()) {
            Action::Ignore => {
                debug!(id = %instance.id, active = instance.active, "ignoring instance");
            }
            Action::Noop => {}
            Action::Create => {
                let level = self.create_and_report(instance).await?;
                info!(id = %instance.id, address = %level.address, "level created");
            }
            Action::Redump => {
                self.pool.destroy(&instance.id).await;
                let level = self.create_and_report(instance).await?;
                info!(id = %instance.id, address = %level.address, "level redumped");
            }
        }
        Ok(())
    }

    /// Tear down an instance on every host and provision it again.
    ///
    /// Used by the one-shot entry point after operator interventions,
    /// when the in-memory index cannot be trusted. Fails when the id is
    /// not in the desired set.
    pub async fn force_redump(&mut self, id: &LevelId) -> Result<()> {
        let desired = self.inventory.fetch_desired().await?;
        let instance = desired
            .iter()
            .find(|instance| instance.id == *id)
            .ok_or_else(|| Error::unknown_instance(id.as_str()))?;
        self.pool.destroy_blind(id).await;
        let level = self.create_and_report(instance).await?;
        info!(%id, address = %level.address, "level force-redumped");
        Ok(())
    }

    async fn create_and_report(&mut self, instance: &DesiredInstance) -> Result<Level> {
        let url = instance
            .tarball_url
            .as_deref()
            .ok_or_else(|| Error::parse(format!("instance {}", instance.id), "no tarball url"))?;
        let level = self.pool.create(&instance.id, url).await?;
        self.inventory.patch_observed(instance, &level).await?;
        Ok(level)
    }
}

fn report(err: &Error) {
    sentry::capture_error(err);
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";
    const URL: &str = "http://store/x.tar";

    fn desired(active: bool, url: Option<&str>, redump: Option<i64>) -> DesiredInstance {
        DesiredInstance::from_value(serde_json::json!({
            "id": ID,
            "active": active,
            "_etag": "etag-1",
            "level": {"url": url, "defaults": {"redump": redump}},
        }))
        .unwrap()
    }

    fn observed(url: &str, dumped_at: Option<DateTime<Utc>>) -> Level {
        let mut level = Level::empty(LevelId::new(ID).unwrap(), "10.0.0.1");
        level.source = Some(tarball_fingerprint(url));
        level.dumped_at = dumped_at;
        level
    }

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn inactive_or_url_less_instances_are_ignored() {
        let now = at("2015-01-06T16:00:00Z");
        let level = observed(URL, Some(at("2015-01-06T15:00:00Z")));

        // inactive wins even with an observed level
        let instance = desired(false, Some(URL), Some(3600));
        assert_eq!(decide(&instance, Some(&level), now), Action::Ignore);

        let instance = desired(true, None, Some(3600));
        assert_eq!(decide(&instance, None, now), Action::Ignore);
    }

    #[test]
    fn unobserved_instances_are_created() {
        let instance = desired(true, Some(URL), Some(3600));
        assert_eq!(
            decide(&instance, None, at("2015-01-06T16:00:00Z")),
            Action::Create
        );
    }

    #[test]
    fn fresh_instances_are_left_alone() {
        let instance = desired(true, Some(URL), Some(3600));
        let level = observed(URL, Some(at("2015-01-06T15:00:00Z")));
        // ten seconds into a one hour interval
        assert_eq!(
            decide(&instance, Some(&level), at("2015-01-06T15:00:10Z")),
            Action::Noop
        );
    }

    #[test]
    fn age_reaching_the_interval_triggers_redump() {
        let instance = desired(true, Some(URL), Some(3600));
        let level = observed(URL, Some(at("2015-01-06T15:00:00Z")));

        // boundary included
        assert_eq!(
            decide(&instance, Some(&level), at("2015-01-06T16:00:00Z")),
            Action::Redump
        );
        assert_eq!(
            decide(&instance, Some(&level), at("2015-01-06T16:00:01Z")),
            Action::Redump
        );
        assert_eq!(
            decide(&instance, Some(&level), at("2015-01-06T15:59:59Z")),
            Action::Noop
        );
    }

    #[test]
    fn url_change_triggers_redump() {
        let instance = desired(true, Some("http://store/y.tar"), Some(3600));
        let level = observed(URL, Some(at("2015-01-06T15:00:00Z")));
        assert_eq!(
            decide(&instance, Some(&level), at("2015-01-06T15:00:10Z")),
            Action::Redump
        );
    }

    #[test]
    fn missing_source_fingerprint_triggers_redump() {
        let instance = desired(true, Some(URL), Some(3600));
        let mut level = observed(URL, Some(at("2015-01-06T15:00:00Z")));
        level.source = None;
        assert_eq!(
            decide(&instance, Some(&level), at("2015-01-06T15:00:10Z")),
            Action::Redump
        );
    }

    #[test]
    fn unix_levels_without_timestamp_never_age_out() {
        let instance = desired(true, Some(URL), Some(3600));
        let level = observed(URL, None);
        assert_eq!(
            decide(&instance, Some(&level), at("2025-01-06T15:00:00Z")),
            Action::Noop
        );
    }

    #[test]
    fn missing_redump_interval_disables_aging() {
        let instance = desired(true, Some(URL), None);
        let level = observed(URL, Some(at("2015-01-06T15:00:00Z")));
        assert_eq!(
            decide(&instance, Some(&level), at("2025-01-06T15:00:00Z")),
            Action::Noop
        );
    }

    /// Transport that acknowledges every command without doing anything
    #[derive(Debug, Default)]
    struct NullTransport;

    #[async_trait::async_trait]
    impl crate::transport::ShellTransport for NullTransport {
        async fn run(&self, _command: &str) -> Result<crate::transport::CommandOutput> {
            Ok(crate::transport::CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                success: true,
            })
        }

        async fn upload(&self, _local: &std::path::Path, _remote: &str) -> Result<()> {
            Ok(())
        }

        fn host(&self) -> &str {
            "test@192.0.2.1"
        }
    }

    /// Reconciler whose inventory endpoint refuses connections
    fn offline_reconciler() -> Reconciler {
        let host = crate::host::HostDriver::with_transport(
            "root@192.0.2.1",
            std::sync::Arc::new(NullTransport),
            8080,
            std::net::Ipv4Addr::new(203, 0, 113, 7),
        );
        let pool = Pool::new(vec![host]).unwrap();
        let inventory = InventoryClient::new("http://127.0.0.1:9", 8080).unwrap();
        Reconciler::new(pool, inventory, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn pass_survives_inventory_outage() {
        // the fetch fails, the pass is skipped, the loop would carry on
        offline_reconciler().pass().await;
    }

    #[tokio::test]
    async fn force_redump_fails_without_inventory() {
        let id = LevelId::new(ID).unwrap();
        assert!(offline_reconciler().force_redump(&id).await.is_err());
    }
}
