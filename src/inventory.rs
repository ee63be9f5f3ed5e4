//! Client for the inventory API of desired level instances.
//!
//! The inventory is an HTTP+JSON store with cursor pagination and
//! optimistic concurrency via `_etag`. TLS verification is disabled in
//! this deployment.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{Level, LevelId};

/// One desired level instance, parsed once at ingestion
#[derive(Debug, Clone)]
pub struct DesiredInstance {
    /// Instance id
    pub id: LevelId,
    /// Whether the instance should be running at all
    pub active: bool,
    /// Concurrency token echoed back on PATCH
    pub etag: String,
    /// Tarball URL of the level; instances without one are ignored
    pub tarball_url: Option<String>,
    /// Age in seconds after which the instance is redumped; absent
    /// disables age-based redump
    pub redump_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawInstance {
    id: String,
    #[serde(default)]
    active: bool,
    #[serde(rename = "_etag", default)]
    etag: String,
    level: Option<RawLevel>,
}

#[derive(Debug, Deserialize)]
struct RawLevel {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    defaults: RawDefaults,
}

#[derive(Debug, Default, Deserialize)]
struct RawDefaults {
    #[serde(default)]
    redump: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(rename = "_items", default)]
    items: Vec<Value>,
    #[serde(rename = "_links", default)]
    links: Option<Links>,
}

#[derive(Debug, Deserialize)]
struct Links {
    #[serde(default)]
    next: Option<Href>,
}

#[derive(Debug, Deserialize)]
struct Href {
    href: String,
}

impl DesiredInstance {
    /// Parse one `_items` element; malformed documents are rejected here
    /// so a bad instance never poisons the whole page
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawInstance = serde_json::from_value(value)?;
        let id = LevelId::new(&raw.id)?;
        let (tarball_url, redump_seconds) = match raw.level {
            Some(level) => (level.url, level.defaults.redump),
            None => (None, None),
        };
        Ok(Self {
            id,
            active: raw.active,
            etag: raw.etag,
            tarball_url,
            redump_seconds,
        })
    }
}

/// Thin HTTP+JSON client for the inventory
#[derive(Debug, Clone)]
pub struct InventoryClient {
    base: String,
    http_level_port: u16,
    client: reqwest::Client,
}

impl InventoryClient {
    /// Create a client for the given API base URL
    pub fn new(base: &str, http_level_port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http_level_port,
            client,
        })
    }

    /// Fetch the full desired-instance list, following the pagination
    /// cursor until exhausted. A non-200 response yields the empty list.
    pub async fn fetch_desired(&self) -> Result<Vec<DesiredInstance>> {
        let mut url = format!(
            "{}/hypervisor-level-instances?embedded={{\"level\":1}}",
            self.base
        );
        let mut instances = Vec::new();
        loop {
            let response = self.client.get(&url).send().await?;
            if !response.status().is_success() {
                warn!(status = %response.status(), %url, "inventory returned non-success");
                return Ok(Vec::new());
            }
            let page: Page = response.json().await?;
            for item in page.items {
                match DesiredInstance::from_value(item) {
                    Ok(instance) => instances.push(instance),
                    Err(err) => warn!(error = %err, "skipping malformed desired instance"),
                }
            }
            match page.links.and_then(|links| links.next) {
                Some(next) => url = join_href(&self.base, &next.href),
                None => break,
            }
        }
        debug!(count = instances.len(), "fetched desired instances");
        Ok(instances)
    }

    /// Report the realized state of one instance back to the inventory.
    ///
    /// Optimistic concurrency is enforced by the server via `If-Match`;
    /// the response status is not inspected further.
    pub async fn patch_observed(&self, instance: &DesiredInstance, level: &Level) -> Result<()> {
        let url = format!("{}/raw-level-instances/{}", self.base, instance.id);
        let body = patch_body(instance, level, self.http_level_port);
        debug!(id = %instance.id, %url, "patching observed state");
        self.client
            .patch(&url)
            .header("If-Match", &instance.etag)
            .json(&body)
            .send()
            .await?;
        Ok(())
    }
}

fn patch_body(instance: &DesiredInstance, level: &Level, http_level_port: u16) -> Value {
    serde_json::json!({
        "private_urls": [{
            "name": "http",
            "url": format!("http://{}:{}/", level.address, http_level_port),
        }],
        "urls": [{
            "name": "http",
            "url": format!("http://{}.levels.pathwar.net:80/", instance.id),
        }],
        "passphrases": level.passphrases,
    })
}

fn join_href(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{}/{}", base, href.trim_start_matches('/'))
    }
}
