//! Per-host ingress proxy bootstrap files.
//!
//! Every host runs one name-based HTTP reverse proxy that routes by
//! `VIRTUAL_HOST` and only accepts connections from the authenticator.

use std::net::{IpAddr, Ipv4Addr};

use tokio::net::lookup_host;

use crate::error::{Error, Result};

/// Directory holding the proxy compose file and access rules on the host
pub const INGRESS_DIR: &str = "hypervisor-nginx-proxy";

/// Compose descriptor for the ingress proxy container.
///
/// The docker socket mount lets the proxy observe stack events and pick
/// up new `VIRTUAL_HOST` values without restarts.
#[must_use]
pub fn proxy_compose(http_port: u16) -> String {
    format!(
        "\
nginx-proxy:
  image: jwilder/nginx-proxy
  restart: always
  ports:
    - \"{http_port}:80\"
  volumes:
    - /var/run/docker.sock:/tmp/docker.sock:ro
    - ./access.conf:/etc/nginx/conf.d/access.conf:ro
"
    )
}

/// Access rules: allow exactly one source address, strip inbound
/// `Authorization` headers.
#[must_use]
pub fn access_rules(auth_ip: Ipv4Addr) -> String {
    format!(
        "\
allow {auth_ip};
deny all;
proxy_set_header Authorization \"\";
"
    )
}

/// Resolve a hostname to its first IPv4 address
pub async fn resolve_ipv4(host: &str) -> Result<Ipv4Addr> {
    let addrs = lookup_host((host, 80)).await.map_err(|err| {
        Error::invalid_config(format!("cannot resolve {host}: {err}"))
    })?;
    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| Error::invalid_config(format!("no IPv4 address for {host}")))
}
