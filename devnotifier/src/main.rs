// SPDX-License-Identifier: GPL-3.0-only

//! Removable device notifier
//!
//! Tracks removable storage through UDisks2: mount state, running
//! operations, filesystem check results and free space.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use devnotifier_types::OperationKind;

mod config;
mod devices;
mod logging;
mod operation;
mod status;
mod watch;

use config::{Config, DeviceFilter, LoggingLevel};

#[derive(Debug, Parser)]
#[command(name = "devnotifier", version)]
#[command(about = "Track removable storage devices and run operations on them")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/devnotifier/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    log_level: Option<LoggingLevel>,

    /// Which devices to track (default: removable)
    #[arg(long, global = true, value_enum)]
    filter: Option<DeviceFilter>,

    /// Track every device, same as `--filter all`
    #[arg(long, global = true, conflicts_with = "filter")]
    all: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Follow device changes until interrupted (default)
    Watch,
    /// Print the state of every tracked device
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Mount a filesystem
    Mount { id: String },
    /// Unmount a filesystem
    Unmount { id: String },
    /// Check a filesystem for errors
    Check { id: String },
    /// Repair a filesystem
    Repair { id: String },
    /// Eject an optical disc
    Eject { id: String },
    /// Unmount every tracked device that can be unmounted
    UnmountAll,
}

impl Command {
    fn operation(&self) -> Option<(OperationKind, &str)> {
        match self {
            Self::Mount { id } => Some((OperationKind::Mount, id.as_str())),
            Self::Unmount { id } => Some((OperationKind::Unmount, id.as_str())),
            Self::Check { id } => Some((OperationKind::Check, id.as_str())),
            Self::Repair { id } => Some((OperationKind::Repair, id.as_str())),
            Self::Eject { id } => Some((OperationKind::Eject, id.as_str())),
            Self::Watch | Self::Status { .. } | Self::UnmountAll => None,
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(filter) = cli.filter {
        config.filter = filter;
    }
    if cli.all {
        config.filter = DeviceFilter::All;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let _log_guard = logging::init(config.log_level, config.log_file.as_deref());

    tracing::debug!("Starting devnotifier v{}", env!("CARGO_PKG_VERSION"));

    let command = cli.command.unwrap_or(Command::Watch);
    if let Some((kind, id)) = command.operation() {
        return operation::run(kind, id).await;
    }

    match command {
        Command::Status { json } => status::run(&config, json).await,
        Command::UnmountAll => operation::run_unmount_all(&config).await,
        _ => watch::run(&config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_watch() {
        let cli = Cli::parse_from(["devnotifier"]);
        assert!(cli.command.is_none());
        assert!(!cli.all);
    }

    #[test]
    fn parses_operation_subcommands() {
        let cli = Cli::parse_from(["devnotifier", "check", "sdb1", "--log-level", "debug"]);

        assert_eq!(cli.log_level, Some(LoggingLevel::Debug));
        let command = cli.command.unwrap();
        assert_eq!(command.operation(), Some((OperationKind::Check, "sdb1")));
    }

    #[test]
    fn parses_filter_and_unmount_all() {
        let cli = Cli::parse_from(["devnotifier", "--filter", "non-removable", "unmount-all"]);

        assert_eq!(cli.filter, Some(DeviceFilter::NonRemovable));
        assert!(matches!(cli.command, Some(Command::UnmountAll)));
        assert_eq!(cli.command.as_ref().and_then(Command::operation), None);

        assert!(Cli::try_parse_from(["devnotifier", "--all", "--filter", "removable"]).is_err());
    }

    #[test]
    fn cli_flags_override_config() {
        let path = std::env::temp_dir().join(format!("devnotifier-cli-{}.toml", std::process::id()));
        std::fs::write(&path, "log_level = \"warn\"\nfilter = \"removable\"\n").unwrap();

        let args: Vec<std::ffi::OsString> = vec![
            "devnotifier".into(),
            "--config".into(),
            path.clone().into_os_string(),
            "--all".into(),
            "status".into(),
            "--json".into(),
        ];
        let cli = Cli::parse_from(args);
        let config = resolve_config(&cli).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.log_level, LoggingLevel::Warn);
        assert_eq!(config.filter, DeviceFilter::All);
        assert!(matches!(cli.command, Some(Command::Status { json: true })));
    }
}
