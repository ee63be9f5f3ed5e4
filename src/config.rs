//! Process configuration, read once from the environment at startup.

use std::env;
use std::time::Duration;

use crate::error::{Error, Result};

/// Immutable process-wide configuration.
///
/// Built once by [`Config::from_env`] and passed through component
/// constructors; nothing re-reads the environment afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the inventory API
    pub api_endpoint: String,
    /// Remote container hosts as `[user@]ip` targets
    pub docker_pool: Vec<String>,
    /// Delay between reconcile passes
    pub refresh_rate: Duration,
    /// Public HTTP port bound by the per-host ingress proxy
    pub http_level_port: u16,
    /// Hostname of the authenticator allowed through the ingress proxy
    pub auth_proxy: String,
    /// Error sink DSN; `None` disables reporting
    pub sentry_url: Option<String>,
}

impl Config {
    /// Read and validate the configuration from the ambient environment
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            api_endpoint: require("API_ENDPOINT")?,
            docker_pool: parse_pool(&require("DOCKER_POOL")?)?,
            refresh_rate: Duration::from_secs(parse_int(&require("REFRESH_RATE")?, "REFRESH_RATE")?),
            http_level_port: parse_int(&require("HTTP_LEVEL_PORT")?, "HTTP_LEVEL_PORT")?,
            auth_proxy: require("AUTH_PROXY")?,
            sentry_url: env::var("SENTRY_URL").ok().filter(|dsn| !dsn.is_empty()),
        })
    }
}

fn require(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::invalid_config(format!("{name} is not set"))),
    }
}

fn parse_int<T: std::str::FromStr>(value: &str, name: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid_config(format!("{name} is not an integer: {value:?}")))
}

fn parse_pool(raw: &str) -> Result<Vec<String>> {
    let hosts: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect();
    if hosts.is_empty() {
        return Err(Error::invalid_config("DOCKER_POOL contains no hosts"));
    }
    Ok(hosts)
}
