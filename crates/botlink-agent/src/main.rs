//! # botlink
//!
//! Supervisor binary: connects the configured upstream accounts, keeps one
//! of them active, and runs the child programs behind their proxies.

#![deny(unsafe_code)]

mod relay;
mod shutdown;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use botlink_children::{ChildProcessManager, ManagerOptions, PortAllocator};
use botlink_core::logging::init_subscriber;
use botlink_upstream::ConnectionManager;

use crate::relay::{ChildRelay, UpstreamRelay, boot_on_first_activation};
use crate::shutdown::ShutdownCoordinator;

/// Upper bound on waiting for the upstream loops after cancel.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// botlink supervisor.
#[derive(Parser, Debug)]
#[command(name = "botlink", about = "Multi-account chat bot supervisor", version)]
struct Cli {
    /// Settings file (defaults to `~/.botlink/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Directory holding child programs (overrides settings).
    #[arg(long)]
    children_dir: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Run upstream connections only; never start child programs.
    #[arg(long)]
    no_children: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args.settings.unwrap_or_else(botlink_settings::settings_path);
    let mut settings = botlink_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    if let Some(dir) = args.children_dir {
        settings.children.dir = dir.display().to_string();
    }
    if let Some(level) = args.log_level {
        settings.logging.level = level;
    }

    init_subscriber(&settings.logging.level, settings.logging.json);
    tracing::info!(
        path = %settings_path.display(),
        accounts = settings.accounts.len(),
        "botlink starting"
    );

    let mut manager = ConnectionManager::new(&settings.upstream);
    manager.configure(&settings.accounts);
    let manager = Arc::new(manager);

    let children = if args.no_children {
        tracing::info!("child programs disabled");
        None
    } else {
        let ports = Arc::new(PortAllocator::new(&settings.ports));
        let children = ChildProcessManager::new(ManagerOptions::from_settings(&settings), ports);
        children.set_message_handler(Arc::new(ChildRelay::new(Arc::clone(&manager))));
        manager.set_active_changed_callback(boot_on_first_activation(children.clone()));
        Some(children)
    };

    let coordinator = ShutdownCoordinator::new(SHUTDOWN_DRAIN);
    let relay = Arc::new(UpstreamRelay::new(Arc::clone(&manager), children.clone()));
    let upstream = {
        let manager = Arc::clone(&manager);
        let token = coordinator.token();
        tokio::spawn(async move { manager.start(relay, token).await })
    };

    let reason = coordinator.wait_for_signal().await?;
    tracing::info!(?reason, "shutting down");
    coordinator.stop(children.as_ref(), upstream).await;

    tracing::info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["botlink"]).unwrap();
        assert!(cli.settings.is_none());
        assert!(cli.children_dir.is_none());
        assert!(cli.log_level.is_none());
        assert!(!cli.no_children);
    }

    #[test]
    fn cli_overrides() {
        let cli = Cli::try_parse_from([
            "botlink",
            "--settings",
            "/etc/botlink.json",
            "--children-dir",
            "/srv/bots",
            "--log-level",
            "debug",
            "--no-children",
        ])
        .unwrap();
        assert_eq!(cli.settings, Some(PathBuf::from("/etc/botlink.json")));
        assert_eq!(cli.children_dir, Some(PathBuf::from("/srv/bots")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(cli.no_children);
    }

    #[test]
    fn cli_rejects_unknown_flags() {
        assert!(Cli::try_parse_from(["botlink", "--bogus"]).is_err());
    }
}
