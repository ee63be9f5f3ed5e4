//! Per-host driver: ingress bootstrap and level lifecycle on one remote
//! Docker host.
//!
//! Every mutating operation is a sequence of shell commands over the
//! host's transport. The driver is the single caller of its transport
//! and must not be used re-entrantly.

use std::collections::HashSet;
use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::compose::ComposeFile;
use crate::error::{Error, Result};
use crate::ingress;
use crate::transport::{shell_quote, ShellTransport, SshTransport};
use crate::types::{tarball_fingerprint, Level, LevelId, LevelType, Passphrase};

/// Directory on the host holding one working directory per instance
pub const LEVELS_DIR: &str = "levels";

/// Shell fragment printing `<name> <value>` per passphrase file.
/// Runs inside the level containers, which may only have a busybox shell.
const PASSPHRASE_DUMP: &str = r#"for f in /pathwar/passphrases/*; do [ -f "$f" ] && echo "$(basename "$f") $(cat "$f")"; done"#;

/// A remote container host addressed as `[user@]ip`
#[derive(Debug, Clone)]
pub struct Host {
    /// Target as configured
    pub display: String,
    /// Address reported to the inventory: the segment after `@`, or the
    /// whole target
    pub ip: String,
}

impl Host {
    /// Parse a `[user@]ip` target
    pub fn new(target: &str) -> Self {
        let ip = target
            .rsplit_once('@')
            .map_or(target, |(_, ip)| ip)
            .to_string();
        Self {
            display: target.to_string(),
            ip,
        }
    }
}

/// Driver for all per-host operations
pub struct HostDriver {
    host: Host,
    transport: Arc<dyn ShellTransport>,
    http_port: u16,
    auth_ip: Ipv4Addr,
}

impl std::fmt::Debug for HostDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDriver")
            .field("host", &self.host.display)
            .finish()
    }
}

impl HostDriver {
    /// Driver over the system ssh client
    pub fn connect(target: &str, http_port: u16, auth_ip: Ipv4Addr) -> Self {
        Self::with_transport(
            target,
            Arc::new(SshTransport::new(target)),
            http_port,
            auth_ip,
        )
    }

    /// Driver over an explicit transport
    pub fn with_transport(
        target: &str,
        transport: Arc<dyn ShellTransport>,
        http_port: u16,
        auth_ip: Ipv4Addr,
    ) -> Self {
        Self {
            host: Host::new(target),
            transport,
            http_port,
            auth_ip,
        }
    }

    /// The host this driver owns
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Address reported for levels running on this host
    pub fn ip(&self) -> &str {
        &self.host.ip
    }

    fn level_dir(id: &LevelId) -> String {
        format!("{LEVELS_DIR}/{id}")
    }

    /// Bring up the ingress proxy; failure never blocks reconciliation
    pub async fn ensure_ingress(&self) {
        if let Err(err) = self.bootstrap_ingress().await {
            warn!(host = %self.host.display, error = %err, "ingress bootstrap failed");
        }
    }

    async fn bootstrap_ingress(&self) -> Result<()> {
        let dir = ingress::INGRESS_DIR;
        self.transport
            .run_checked(&format!("mkdir -p {dir}"))
            .await?;
        self.upload_text(
            &ingress::proxy_compose(self.http_port),
            &format!("{dir}/docker-compose.yml"),
        )
        .await?;
        self.upload_text(
            &ingress::access_rules(self.auth_ip),
            &format!("{dir}/access.conf"),
        )
        .await?;
        self.transport
            .run_checked(&format!("cd {dir} && docker-compose up -d"))
            .await?;
        Ok(())
    }

    /// Stage text in a scoped temp file and upload it
    async fn upload_text(&self, content: &str, remote: &str) -> Result<()> {
        let mut staged = NamedTempFile::new()?;
        staged.write_all(content.as_bytes())?;
        staged.flush()?;
        self.transport.upload(staged.path(), remote).await
    }

    /// Ids of level instances currently running on the host
    pub async fn list_running_ids(&self) -> Result<HashSet<LevelId>> {
        let output = self
            .transport
            .run_checked("docker ps --format '{{.Names}}'")
            .await?;
        Ok(output
            .stdout
            .lines()
            .filter_map(LevelId::from_container_name)
            .collect())
    }

    /// Provision a level from a tarball URL.
    ///
    /// Idempotent per URL: the tarball is downloaded and its images are
    /// imported only when the `source` fingerprint on the host changed.
    pub async fn create(&self, id: &LevelId, tarball_url: &str) -> Result<()> {
        let dir = Self::level_dir(id);
        let digest = tarball_fingerprint(tarball_url);
        let cache = format!("/tmp/{digest}");

        // no-clobber download keyed by the URL fingerprint
        self.transport
            .run_checked(&format!(
                "test -e {cache} || curl -fsSL -o {cache} {}",
                shell_quote(tarball_url)
            ))
            .await?;

        let current = self.transport.run(&format!("cat {dir}/source")).await?;
        if !current.success || current.stdout_trimmed() != digest {
            self.transport
                .run_checked(&format!("mkdir -p {dir} && tar -xf {cache} -C {dir}"))
                .await?;
            self.transport
                .run_checked(&format!("echo {digest} > {dir}/source && touch {dir}/REBUILD"))
                .await?;
        } else {
            debug!(host = %self.host.display, %id, "tarball unchanged, skipping extraction");
        }

        let text = self
            .transport
            .run_checked(&format!("cat {dir}/docker-compose.yml"))
            .await?
            .stdout;
        let mut compose = ComposeFile::parse(&text)?;

        let rebuild = self
            .transport
            .run(&format!("test -e {dir}/REBUILD"))
            .await?
            .success;
        if rebuild {
            for (name, service) in compose.services_mut() {
                let Some(image) = service.image.clone() else {
                    continue;
                };
                let Some(artifact) = image.strip_prefix("image-for-") else {
                    continue;
                };
                self.transport
                    .run_checked(&format!("cat {dir}/{artifact}.tar | docker import - {image}"))
                    .await?;
                service.normalize_environment();
                service.default_env("VIRTUAL_HOST", id.as_str());
                debug!(host = %self.host.display, %id, service = %name, %image, "imported service image");
            }
        }

        self.upload_text(&compose.to_yaml()?, &format!("{dir}/docker-compose.yml"))
            .await?;
        self.transport
            .run_checked(&format!("rm -f {dir}/REBUILD"))
            .await?;

        self.transport
            .run_checked(&format!("cd {dir} && docker-compose build"))
            .await?;

        match compose.level_type() {
            LevelType::Web => {
                self.transport
                    .run_checked(&format!("cd {dir} && docker-compose up -d"))
                    .await?;
            }
            LevelType::Unix => {
                // one-shot stack: run the first service to completion and
                // commit the named container as the level image
                let (service, _) = compose.first_service().ok_or_else(|| {
                    Error::parse(format!("docker-compose.yml for {id}"), "no services")
                })?;
                let run_name = format!("unix-run-{id}");
                self.transport
                    .run_checked(&format!(
                        "cd {dir} && docker-compose run --name {run_name} {service}"
                    ))
                    .await?;
                self.transport
                    .run_checked(&format!("docker commit {run_name} unix-{id}"))
                    .await?;
                let _ = self.transport.run(&format!("docker rm -f {run_name}")).await;
            }
        }
        Ok(())
    }

    /// Best-effort teardown; never raises
    pub async fn destroy(&self, id: &LevelId) {
        if matches!(self.level_type(id).await, Ok(LevelType::Unix)) {
            let kill = format!(
                "docker ps -q --filter label=ssh2docker --filter ancestor=unix-{id} \
                 | xargs -r docker kill"
            );
            if let Err(err) = self.transport.run(&kill).await {
                debug!(host = %self.host.display, %id, error = %err, "unix kill failed");
            }
        }
        let dir = Self::level_dir(id);
        let teardown =
            format!("test -d {dir} && cd {dir} && docker-compose kill && docker-compose rm -fv");
        if let Err(err) = self.transport.run(&teardown).await {
            debug!(host = %self.host.display, %id, error = %err, "compose teardown failed");
        }
    }

    /// Collect the observed state of an instance.
    ///
    /// Sub-failures are tolerated: the corresponding field stays empty
    /// when a probe fails.
    pub async fn inspect(&self, id: &LevelId) -> Level {
        let mut level = Level::empty(id.clone(), &self.host.ip);
        let dir = Self::level_dir(id);

        if let Ok(output) = self.transport.run(&format!("cat {dir}/source")).await {
            if output.success && !output.stdout_trimmed().is_empty() {
                level.source = Some(output.stdout_trimmed().to_string());
            }
        }

        match self.level_type(id).await.unwrap_or_default() {
            LevelType::Unix => {
                // dumped_at and version stay unset for a committed image
                if let Ok(output) = self
                    .transport
                    .run(&format!("docker run --rm unix-{id} /bin/sh -c '{PASSPHRASE_DUMP}'"))
                    .await
                {
                    level.passphrases = parse_passphrases(&output.stdout);
                }
            }
            LevelType::Web => {
                let containers = match self
                    .transport
                    .run(&format!("cd {dir} && docker-compose ps -q"))
                    .await
                {
                    Ok(output) if output.success => output
                        .stdout
                        .lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(str::to_string)
                        .collect(),
                    _ => Vec::new(),
                };

                if let Some(first) = containers.first() {
                    if let Ok(output) = self
                        .transport
                        .run(&format!(
                            "docker inspect --format '{{{{.State.StartedAt}}}}' {first}"
                        ))
                        .await
                    {
                        level.dumped_at = parse_started_at(output.stdout_trimmed());
                    }
                }

                for container in &containers {
                    if level.version.is_none() {
                        if let Ok(output) = self
                            .transport
                            .run(&format!("docker exec {container} cat /pathwar/level.yml"))
                            .await
                        {
                            if output.success {
                                level.version = parse_version(&output.stdout);
                            }
                        }
                    }
                    if let Ok(output) = self
                        .transport
                        .run(&format!("docker exec {container} /bin/sh -c '{PASSPHRASE_DUMP}'"))
                        .await
                    {
                        level.passphrases.extend(parse_passphrases(&output.stdout));
                    }
                }
            }
        }
        level
    }

    /// Level type read from the instance's compose file on this host
    pub async fn level_type(&self, id: &LevelId) -> Result<LevelType> {
        let dir = Self::level_dir(id);
        let text = self
            .transport
            .run_checked(&format!("cat {dir}/docker-compose.yml"))
            .await?
            .stdout;
        Ok(ComposeFile::parse(&text)?.level_type())
    }
}

fn parse_passphrases(raw: &str) -> Vec<Passphrase> {
    raw.lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once(' ')?;
            (!key.is_empty()).then(|| Passphrase {
                key: key.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

fn parse_version(level_yml: &str) -> Option<String> {
    level_yml.lines().find_map(|line| {
        let value = line
            .trim()
            .strip_prefix("version:")?
            .trim()
            .trim_matches(|c| c == '"' || c == '\'');
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn parse_started_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
