//! sdpc: SDP client tunnel manager.
//!
//! `run` starts the manager and its IPC pipe until SIGINT/SIGTERM;
//! `ask` performs the blocking service request against a running
//! manager.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use sdpc_manager::ipc::{self, IpcServer, PipeRole};
use sdpc_manager::{LogTrafficHandler, ManagerConfig, StanzaResolver, TunnelManager};

/// sdpc — SDP client tunnel manager
#[derive(Parser, Debug)]
#[command(name = "sdpc", version, about = "SDP client tunnel manager")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Run the tunnel manager until SIGINT/SIGTERM
    Run {
        /// Service stanza file mapping service ids to gateways
        #[arg(long)]
        config: PathBuf,

        /// This client's SDP id
        #[arg(long)]
        sdp_id: u32,

        /// Directory holding the IPC pipes
        #[arg(long)]
        socket_dir: Option<PathBuf>,
    },
    /// Ask a running manager for access to a service
    Ask {
        #[arg(long)]
        sdp_id: u32,

        /// Comma-separated service id list; the first usable id is requested
        #[arg(long)]
        services: String,

        #[arg(long)]
        idp_id: u32,

        /// Identity token proving the requester's identity
        #[arg(long)]
        token: String,

        /// Directory holding the IPC pipes
        #[arg(long)]
        socket_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let result = match cli.command {
        CliCommand::Run {
            config,
            sdp_id,
            socket_dir,
        } => run_manager(config, sdp_id, socket_dir).await,
        CliCommand::Ask {
            sdp_id,
            services,
            idp_id,
            token,
            socket_dir,
        } => ask(sdp_id, services, idp_id, token, socket_dir).await,
    };

    if let Err(e) = result {
        error!(error = %e, "sdpc failed");
        std::process::exit(1);
    }
}

async fn run_manager(
    config_path: PathBuf,
    sdp_id: u32,
    socket_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        sdp_id, "starting tunnel manager"
    );

    let resolver = StanzaResolver::load(&config_path)
        .with_context(|| format!("cannot load stanza file {}", config_path.display()))?;

    let config = ManagerConfig {
        sdp_id,
        ..ManagerConfig::default()
    };
    let (manager, handle) = TunnelManager::new(
        config,
        Arc::new(resolver),
        Arc::new(LogTrafficHandler),
    );

    let dir = socket_dir.unwrap_or_else(ipc::default_socket_dir);
    let server = IpcServer::bind(&dir, PipeRole::Client, handle.clone())
        .with_context(|| format!("cannot bind IPC pipe under {}", dir.display()))?;

    let manager_task = tokio::spawn(manager.run());
    let ipc_task = tokio::spawn(server.run());

    shutdown_signal().await;
    info!("received shutdown signal");

    handle.shutdown().await;
    ipc_task.abort();
    let _ = manager_task.await;

    info!("tunnel manager stopped");
    Ok(())
}

async fn ask(
    sdp_id: u32,
    services: String,
    idp_id: u32,
    token: String,
    socket_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let dir = socket_dir.unwrap_or_else(ipc::default_socket_dir);
    let path = ipc::pipe_path(&dir, PipeRole::Client);

    // the ask call blocks (60s read timeout); keep it off the runtime
    tokio::task::spawn_blocking(move || {
        ipc::ask_for_service(&path, sdp_id, &services, idp_id, &token)
    })
    .await?
    .context("service request failed")?;

    info!("service request granted");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
