//! Typed model of a level's compose stack descriptor.
//!
//! Levels ship either the flat document shape (services keyed at the top
//! level) or the nested shape with a `services:` section; both parse into
//! the same model and re-emit in the shape they arrived in. Service order
//! is preserved because the first service is load-bearing (level type,
//! unix run target).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{Error, Result};
use crate::types::LevelType;

/// A map-or-list section of a compose service (`environment`, `labels`).
///
/// Both accepted shapes normalize to the map form; writes always emit the
/// map form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValues {
    /// `- KEY=VALUE` entries
    List(Vec<String>),
    /// `KEY: VALUE` entries
    Map(IndexMap<String, Value>),
}

impl KeyValues {
    /// Normalize to a string-keyed, string-valued map
    #[must_use]
    pub fn to_map(&self) -> IndexMap<String, String> {
        match self {
            Self::List(entries) => entries
                .iter()
                .map(|entry| match entry.split_once('=') {
                    Some((key, value)) => (key.to_string(), value.to_string()),
                    None => (entry.clone(), String::new()),
                })
                .collect(),
            Self::Map(map) => map
                .iter()
                .map(|(key, value)| (key.clone(), scalar_string(value)))
                .collect(),
        }
    }

    /// Build the canonical map form
    #[must_use]
    pub fn from_map(map: IndexMap<String, String>) -> Self {
        Self::Map(
            map.into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect(),
        )
    }

    /// Look up an entry by key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        match self {
            Self::List(entries) => entries.iter().find_map(|entry| {
                let (k, v) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
                (k == key).then(|| v.to_string())
            }),
            Self::Map(map) => map.get(key).map(scalar_string),
        }
    }
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// One service of a compose stack.
///
/// Fields the hypervisor does not touch ride along in `extra` and are
/// written back untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Image reference; `image-for-<NAME>` marks an imported artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Environment section, list or map form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<KeyValues>,
    /// Labels section, list or map form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<KeyValues>,
    /// Remaining service keys, passed through verbatim
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl Service {
    /// Tar artifact name for services whose image is imported from the
    /// level tarball (`image-for-NAME` -> `NAME`)
    #[must_use]
    pub fn import_artifact(&self) -> Option<&str> {
        self.image.as_deref()?.strip_prefix("image-for-")
    }

    /// Normalized view of the environment section
    #[must_use]
    pub fn environment_map(&self) -> IndexMap<String, String> {
        self.environment
            .as_ref()
            .map(KeyValues::to_map)
            .unwrap_or_default()
    }

    /// Rewrite the environment into the canonical map form
    pub fn normalize_environment(&mut self) {
        self.environment = Some(KeyValues::from_map(self.environment_map()));
    }

    /// Set an environment variable unless the service already sets one
    pub fn default_env(&mut self, key: &str, value: &str) {
        let mut map = self.environment_map();
        if !map.contains_key(key) {
            map.insert(key.to_string(), value.to_string());
        }
        self.environment = Some(KeyValues::from_map(map));
    }

    /// Look up a label by key
    #[must_use]
    pub fn label(&self, key: &str) -> Option<String> {
        self.labels.as_ref()?.get(key)
    }
}

/// A parsed compose stack descriptor
#[derive(Debug, Clone)]
pub struct ComposeFile {
    services: IndexMap<String, Service>,
    /// Top-level keys other than `services` (nested shape only)
    prelude: IndexMap<String, Value>,
    nested: bool,
}

impl ComposeFile {
    /// Parse a compose document in either the flat or nested shape
    pub fn parse(text: &str) -> Result<Self> {
        let doc: IndexMap<String, Value> = serde_yaml::from_str(text)?;

        if let Some(services) = doc.get("services") {
            if services.is_mapping() {
                let services: IndexMap<String, Service> =
                    serde_yaml::from_value(services.clone())?;
                let prelude = doc
                    .into_iter()
                    .filter(|(key, _)| key != "services")
                    .collect();
                return Ok(Self {
                    services,
                    prelude,
                    nested: true,
                });
            }
        }

        let mut services = IndexMap::new();
        for (name, value) in doc {
            let service: Service = serde_yaml::from_value(value)
                .map_err(|err| Error::parse(format!("compose service {name:?}"), err.to_string()))?;
            services.insert(name, service);
        }
        Ok(Self {
            services,
            prelude: IndexMap::new(),
            nested: false,
        })
    }

    /// Re-emit the document, in the shape it arrived in
    pub fn to_yaml(&self) -> Result<String> {
        let text = if self.nested {
            let mut doc = self.prelude.clone();
            doc.insert("services".to_string(), serde_yaml::to_value(&self.services)?);
            serde_yaml::to_string(&doc)?
        } else {
            serde_yaml::to_string(&self.services)?
        };
        Ok(text)
    }

    /// First service in document order
    #[must_use]
    pub fn first_service(&self) -> Option<(&str, &Service)> {
        self.services
            .first()
            .map(|(name, service)| (name.as_str(), service))
    }

    /// Iterate services in document order
    pub fn services(&self) -> impl Iterator<Item = (&String, &Service)> {
        self.services.iter()
    }

    /// Iterate services mutably in document order
    pub fn services_mut(&mut self) -> impl Iterator<Item = (&String, &mut Service)> {
        self.services.iter_mut()
    }

    /// Level type declared by the first service's labels.
    ///
    /// `PWR_LEVEL_TYPE` wins over the legacy `PATHWAR_LEVEL_TYPE`;
    /// everything else is a web level.
    #[must_use]
    pub fn level_type(&self) -> LevelType {
        self.first_service()
            .and_then(|(_, service)| {
                service
                    .label("PWR_LEVEL_TYPE")
                    .or_else(|| service.label("PATHWAR_LEVEL_TYPE"))
            })
            .map(|label| LevelType::parse(&label))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLAT: &str = "\
web:
  image: image-for-web
  environment:
    - SECRET=hunter2
    - DEBUG
  labels:
    PWR_LEVEL_TYPE: web
db:
  image: postgres:9.4
";

    const NESTED: &str = "\
version: '2'
services:
  shell:
    image: image-for-shell
    labels:
      - PATHWAR_LEVEL_TYPE=unix
";

    #[test]
    fn parses_flat_document() {
        let compose = ComposeFile::parse(FLAT).unwrap();
        let names: Vec<_> = compose.services().map(|(name, _)| name.clone()).collect();
        assert_eq!(names, vec!["web", "db"]);
        let (first, service) = compose.first_service().unwrap();
        assert_eq!(first, "web");
        assert_eq!(service.import_artifact(), Some("web"));
        assert_eq!(compose.level_type(), LevelType::Web);
    }

    #[test]
    fn parses_nested_document() {
        let compose = ComposeFile::parse(NESTED).unwrap();
        let (name, service) = compose.first_service().unwrap();
        assert_eq!(name, "shell");
        assert_eq!(service.import_artifact(), Some("shell"));
        // label in list form, legacy key
        assert_eq!(compose.level_type(), LevelType::Unix);
    }

    #[test]
    fn environment_list_normalizes_without_losing_keys() {
        let compose = ComposeFile::parse(FLAT).unwrap();
        let (_, service) = compose.first_service().unwrap();
        let map = service.environment_map();
        assert_eq!(map.get("SECRET").map(String::as_str), Some("hunter2"));
        // a bare KEY entry keeps its key with an empty value
        assert_eq!(map.get("DEBUG").map(String::as_str), Some(""));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn default_env_inserts_once() {
        let mut compose = ComposeFile::parse(FLAT).unwrap();
        for (_, service) in compose.services_mut() {
            service.normalize_environment();
            service.default_env("VIRTUAL_HOST", "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee");
        }
        let (_, service) = compose.first_service().unwrap();
        let map = service.environment_map();
        assert_eq!(
            map.get("VIRTUAL_HOST").map(String::as_str),
            Some("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee")
        );
        // existing keys survive
        assert_eq!(map.get("SECRET").map(String::as_str), Some("hunter2"));
    }

    #[test]
    fn default_env_respects_existing_value() {
        let text = "\
web:
  image: image-for-web
  environment:
    VIRTUAL_HOST: custom.example.net
";
        let mut compose = ComposeFile::parse(text).unwrap();
        for (_, service) in compose.services_mut() {
            service.default_env("VIRTUAL_HOST", "some-id");
        }
        let (_, service) = compose.first_service().unwrap();
        assert_eq!(
            service.environment_map().get("VIRTUAL_HOST").map(String::as_str),
            Some("custom.example.net")
        );
    }

    #[test]
    fn round_trip_emits_canonical_map_form() {
        let mut compose = ComposeFile::parse(FLAT).unwrap();
        for (_, service) in compose.services_mut() {
            service.normalize_environment();
        }
        let text = compose.to_yaml().unwrap();
        assert!(text.contains("SECRET: hunter2"));
        assert!(!text.contains("- SECRET=hunter2"));

        let reparsed = ComposeFile::parse(&text).unwrap();
        let names: Vec<_> = reparsed.services().map(|(name, _)| name.clone()).collect();
        assert_eq!(names, vec!["web", "db"]);
    }

    #[test]
    fn nested_round_trip_keeps_prelude() {
        let compose = ComposeFile::parse(NESTED).unwrap();
        let text = compose.to_yaml().unwrap();
        assert!(text.contains("version:"));
        assert!(text.contains("services:"));
        let reparsed = ComposeFile::parse(&text).unwrap();
        assert_eq!(reparsed.level_type(), LevelType::Unix);
    }

    #[test]
    fn unknown_service_keys_ride_along() {
        let text = "\
web:
  image: image-for-web
  ports:
    - '80'
  volumes:
    - /data:/data
";
        let compose = ComposeFile::parse(text).unwrap();
        let emitted = compose.to_yaml().unwrap();
        assert!(emitted.contains("ports:"));
        assert!(emitted.contains("/data:/data"));
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(ComposeFile::parse("just a string").is_err());
        assert!(ComposeFile::parse("web: 12").is_err());
    }
}
