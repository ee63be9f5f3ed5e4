//! CLI entry point: run the reconcile loop, or force-redump one instance.

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pathwar_hypervisor::{
    ingress, transport, Config, HostDriver, InventoryClient, LevelId, Pool, Reconciler, Result,
};

#[derive(Debug, Parser)]
#[command(name = "pathwar-hypervisor", version, about = "Level hypervisor daemon")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile the inventory against the host pool forever (default)
    Loop,
    /// Tear down one instance on every host, recreate it, and exit
    ForceRedump {
        /// Instance id, dashed or compact form
        #[arg(long)]
        uuid: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration error");
            std::process::exit(1);
        }
    };

    let sentry_guard = config.sentry_url.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    if let Err(err) = run(args.command.unwrap_or(Command::Loop), config).await {
        error!(error = %err, "hypervisor failed");
        sentry::capture_error(&err);
        // process::exit skips destructors, flush the sink first
        drop(sentry_guard);
        std::process::exit(1);
    }
}

async fn run(command: Command, config: Config) -> Result<()> {
    transport::ensure_client_binaries()?;
    let auth_ip = ingress::resolve_ipv4(&config.auth_proxy).await?;
    info!(auth_proxy = %config.auth_proxy, %auth_ip, "resolved authenticator");

    let inventory = InventoryClient::new(&config.api_endpoint, config.http_level_port)?;
    let hosts = config
        .docker_pool
        .iter()
        .map(|target| HostDriver::connect(target, config.http_level_port, auth_ip))
        .collect();
    let mut pool = Pool::new(hosts)?;
    pool.bootstrap_ingress().await;
    pool.load().await;

    let mut reconciler = Reconciler::new(pool, inventory, config.refresh_rate);
    match command {
        Command::Loop => {
            info!(refresh = ?config.refresh_rate, "entering reconcile loop");
            reconciler.run().await
        }
        Command::ForceRedump { uuid } => {
            let id = LevelId::new(&uuid)?;
            reconciler.force_redump(&id).await
        }
    }
}
