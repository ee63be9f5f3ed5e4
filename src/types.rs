//! Core types shared across the hypervisor.
//!
//! Level ids are carried in the canonical dashed UUID form everywhere
//! inside the process; the compact 32-hex form only appears at the edges
//! (container names, inventory documents).

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha224};
use uuid::Uuid;

use crate::error::Error;

/// Running container names embed the compact instance id followed by
/// `_<service>_<ordinal>`.
static CONTAINER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*([a-z0-9]{32})_.+_.+$").expect("container name regex"));

/// A validated level instance identifier in canonical dashed UUID form
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LevelId(String);

impl LevelId {
    /// Parse an id from either the compact 32-hex or the dashed form
    pub fn new(id: impl AsRef<str>) -> Result<Self, Error> {
        let raw = id.as_ref();
        let uuid = Uuid::parse_str(raw)
            .map_err(|err| Error::parse(format!("level id {raw:?}"), err.to_string()))?;
        Ok(Self(uuid.as_hyphenated().to_string()))
    }

    /// Extract the instance id embedded in a running container name
    pub fn from_container_name(name: &str) -> Option<Self> {
        let captures = CONTAINER_NAME.captures(name.trim())?;
        Self::new(&captures[1]).ok()
    }

    /// Get the id as a dashed string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the compact 32-hex form used in container names
    pub fn compact(&self) -> String {
        self.0.chars().filter(|c| *c != '-').collect()
    }
}

impl fmt::Display for LevelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LevelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A single passphrase extracted from a running level
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Passphrase {
    /// Passphrase name (the file name under the passphrases directory)
    pub key: String,
    /// Passphrase content
    pub value: String,
}

/// Observed realization of a level instance on one host
#[derive(Debug, Clone, Serialize)]
pub struct Level {
    /// Instance id
    pub id: LevelId,
    /// IP of the host the stack runs on
    pub address: String,
    /// When the first container of the stack was started
    pub dumped_at: Option<DateTime<Utc>>,
    /// Version declared by the level, if any
    pub version: Option<String>,
    /// Passphrases collected from the running containers
    pub passphrases: Vec<Passphrase>,
    /// Fingerprint of the tarball URL last extracted on the host
    pub source: Option<String>,
}

impl Level {
    /// An empty observation for an instance on a given host
    pub fn empty(id: LevelId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            dumped_at: None,
            version: None,
            passphrases: Vec::new(),
            source: None,
        }
    }
}

/// How a level's stack is materialized on a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LevelType {
    /// Long-running stack behind the ingress proxy
    #[default]
    Web,
    /// One-shot image committed for an SSH frontend
    Unix,
}

impl LevelType {
    /// Parse a level type label, defaulting to web
    pub fn parse(label: &str) -> Self {
        match label.trim() {
            "unix" => Self::Unix,
            _ => Self::Web,
        }
    }
}

impl fmt::Display for LevelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Web => write!(f, "web"),
            Self::Unix => write!(f, "unix"),
        }
    }
}

/// Content fingerprint of a tarball URL: hex SHA-224 of the URL bytes.
///
/// Doubles as the cache file name under `/tmp` on the host and as the
/// change-detection value written to `levels/<id>/source`.
pub fn tarball_fingerprint(url: &str) -> String {
    format!("{:x}", Sha224::digest(url.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_id_canonical_dashing() {
        let id = LevelId::new("aaaaaaaabbbbccccddddeeeeeeeeeeee").unwrap();
        assert_eq!(id.as_str(), "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee");
        assert_eq!(id.compact(), "aaaaaaaabbbbccccddddeeeeeeeeeeee");
    }

    #[test]
    fn level_id_accepts_dashed_form() {
        let id = LevelId::new("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee").unwrap();
        assert_eq!(id.as_str(), "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee");
    }

    #[test]
    fn level_id_rejects_garbage() {
        assert!(LevelId::new("not-an-id").is_err());
        assert!(LevelId::new("aaaaaaaabbbbccccddddeeeeeeeeeee").is_err());
        assert!(LevelId::new("").is_err());
    }

    #[test]
    fn container_name_extraction() {
        let id = LevelId::from_container_name("aaaaaaaabbbbccccddddeeeeeeeeeeee_web_1").unwrap();
        assert_eq!(id.as_str(), "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee");

        // compose prefixes survive because the match is anchored at the end
        let id =
            LevelId::from_container_name("levels_aaaaaaaabbbbccccddddeeeeeeeeeeee_db_2").unwrap();
        assert_eq!(id.as_str(), "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee");
    }

    #[test]
    fn container_name_rejects_non_levels() {
        assert!(LevelId::from_container_name("nginx-proxy").is_none());
        assert!(LevelId::from_container_name("short_web_1").is_none());
        // 32 alphanumerics that are not hex digits are not an id
        assert!(LevelId::from_container_name("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz_web_1").is_none());
    }

    #[test]
    fn fingerprint_known_vectors() {
        // SHA-224 test vectors
        assert_eq!(
            tarball_fingerprint(""),
            "d14a028c2a3a2bc9476102bb288234c415a2b01f828ea62ac5b3e42f"
        );
        assert_eq!(
            tarball_fingerprint("abc"),
            "23097d223405d8228642a477bda255b32aadbce4bda0b3f7e36c9da7"
        );
    }

    #[test]
    fn fingerprint_distinguishes_urls() {
        let a = tarball_fingerprint("http://store/x.tar");
        let b = tarball_fingerprint("http://store/y.tar");
        assert_ne!(a, b);
        assert_eq!(a.len(), 56);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn level_type_parse() {
        assert_eq!(LevelType::parse("unix"), LevelType::Unix);
        assert_eq!(LevelType::parse("web"), LevelType::Web);
        assert_eq!(LevelType::parse("anything-else"), LevelType::Web);
    }
}
