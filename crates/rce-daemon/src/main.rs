//! RCE Daemon - runs a node or manages local instances
//!
//! Without a subcommand `rced` runs a node, optionally on a profile
//! directory (`--profile <dir> --batch` is how managed instances are launched).
//! `rced im ...` manages installations and instances on this machine.

use anyhow::Context;
use clap::Parser;
use rce_daemon::{
    lock_profile, resolve_node_id, run_im_command, shutdown_requested, shutdown_signal, Cli,
    Command, ConsoleOutputReceiver, DaemonConfig, DaemonError, Node, STARTUP_MARKER,
};
use rce_instance::profile::clear_shutdown_data;
use rce_instance::{InstanceManagementService, TextOutputReceiver};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config =
        DaemonConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // Initialize tracing; stdout is reserved for markers and command output
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    match cli.command {
        Some(Command::Im { command }) => {
            let service =
                InstanceManagementService::with_local_processes(config.instance_management);
            let output: Arc<dyn TextOutputReceiver> = Arc::new(ConsoleOutputReceiver);
            if let Err(e) = run_im_command(&service, command, output).await {
                eprintln!("{}", e);
                std::process::exit(1);
            }
            Ok(())
        }
        None => run_node(config, cli.profile, cli.workflow, cli.batch).await,
    }
}

async fn run_node(
    config: DaemonConfig,
    profile: Option<PathBuf>,
    workflow: Option<PathBuf>,
    batch: bool,
) -> anyhow::Result<()> {
    let _profile_lock = match &profile {
        Some(dir) => match lock_profile(dir) {
            Ok(lock) => Some(lock),
            Err(e @ DaemonError::ProfileLocked(_)) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
            Err(e) => return Err(e).context("Failed to prepare profile directory"),
        },
        None => None,
    };

    let node_id = resolve_node_id(&config, profile.as_deref());
    let node = Node::start(node_id, &config);

    if !batch {
        println!(
            "RCE node {} (version {})",
            node.node_id(),
            env!("CARGO_PKG_VERSION")
        );
    }
    println!("{}", STARTUP_MARKER);

    if let Some(path) = workflow {
        let information = node
            .start_workflow_file(&path)
            .await
            .with_context(|| format!("Failed to start workflow {}", path.display()))?;
        tracing::info!(
            handle = %information.handle,
            instance = %information.instance_name,
            "Started workflow from file"
        );
    }

    match &profile {
        Some(dir) => {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = shutdown_requested(dir) => {}
            }
        }
        None => shutdown_signal().await,
    }
    node.shutdown();

    if let Some(dir) = &profile {
        if let Err(e) = clear_shutdown_data(dir) {
            tracing::warn!(error = %e, "Failed to clear shutdown data");
        }
    }
    Ok(())
}
