use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use porthop_engine::{Config, Server};

mod tun;

#[derive(Parser)]
#[command(name = "porthop", version, about = "port-hopping UDP VPN server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the VPN server
    Server {
        /// Path to the TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// File descriptor of an already opened and configured TUN device
        #[arg(long)]
        tun_fd: i32,
    },
    /// Print a sample configuration file
    GenConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_log::LogTracer::init().context("installing log bridge")?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match Cli::parse().command {
        Command::Server { config, tun_fd } => run_server(config, tun_fd).await,
        Command::GenConfig => {
            print!("{}", Config::sample());
            Ok(())
        }
    }
}

async fn run_server(path: PathBuf, tun_fd: i32) -> anyhow::Result<()> {
    let config = Config::load(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    let mtu = config.common.mtu;
    let server = Server::new(config).context("building server")?;
    let tun = Arc::new(tun::FdTun::from_raw_fd(tun_fd, mtu).context("attaching tun fd")?);
    tracing::info!("tunnel gateway is {}", server.gateway());

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("signal received, shutting down");
        let _ = shutdown.send(());
    });

    server.run(tun).await.context("server loop")
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
