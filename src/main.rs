use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;

use syftbox_core::apps;
use syftbox_core::config::{Config, ConfigOverrides};
use syftbox_core::daemon::{self, DaemonOptions};
use syftbox_core::perm::PermissionEngine;
use syftbox_core::server::{self, ServerState};
use syftbox_core::store::MetadataStore;

#[derive(Parser, Debug)]
#[command(name = "syftbox", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Email override (takes precedence over env/config)
    #[arg(long = "email")]
    email: Option<String>,

    /// Data directory override (takes precedence over env/config)
    #[arg(long = "datadir")]
    datadir: Option<PathBuf>,

    /// Server URL override (takes precedence over env/config)
    #[arg(long = "server")]
    server: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync daemon against a local datasite
    Daemon,

    /// Run the sync server, serving a snapshot directory over HTTP
    Server {
        /// Address to bind the sync server
        #[arg(short = 'a', long = "addr", default_value = "0.0.0.0:8080")]
        addr: String,

        /// Snapshot directory to serve (defaults to <datadir>/datasites)
        #[arg(long = "snapshot-root")]
        snapshot_root: Option<PathBuf>,
    },

    /// Print the resolved config file path
    ConfigPath,

    /// Print version information
    Version,

    /// Manage SyftBox apps
    App {
        #[command(subcommand)]
        command: AppCommands,
    },
}

#[derive(Subcommand, Debug)]
enum AppCommands {
    /// List installed apps
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        email,
        datadir,
        server,
        command,
    } = Cli::parse();
    let resolved_config = Config::resolve_config_path(config.as_deref());
    let overrides = ConfigOverrides {
        email,
        data_dir: datadir,
        server_url: server,
    };

    match command {
        Some(Commands::ConfigPath) => {
            println!("{}", resolved_config.display());
            Ok(())
        }
        Some(Commands::Version) => {
            println!("{}", detailed_version());
            Ok(())
        }
        Some(Commands::App { command }) => {
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_app(command, &cfg)
        }
        Some(Commands::Server { addr, snapshot_root }) => {
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_server(cfg, addr, snapshot_root).await
        }
        Some(Commands::Daemon) | None => {
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            let shutdown = Arc::new(tokio::sync::Notify::new());
            let shutdown_signal = shutdown.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                shutdown_signal.notify_waiters();
            });
            daemon::run_daemon_with_shutdown(cfg, DaemonOptions::default(), shutdown).await
        }
    }
}

async fn run_server(cfg: Config, addr: String, snapshot_root: Option<PathBuf>) -> Result<()> {
    let log_path = syftbox_core::config::default_log_file_path();
    syftbox_core::logging::init_log_file(&log_path)?;

    let snapshot_root = snapshot_root.unwrap_or_else(|| cfg.data_dir.join("datasites"));
    std::fs::create_dir_all(&snapshot_root)
        .with_context(|| format!("create {}", snapshot_root.display()))?;

    let mut store = MetadataStore::open(&cfg.data_dir)?;
    let permissions = PermissionEngine::new();
    permissions
        .migrate_legacy_files(&snapshot_root)
        .context("migrate legacy permission files")?;
    permissions
        .load_all(&mut store, &cfg.data_dir)
        .context("load permission rules")?;

    let state = Arc::new(ServerState {
        snapshot_root,
        store: Mutex::new(store),
        permissions,
    });

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid bind address {addr}"))?;
    server::serve(addr, state, None).await
}

fn run_app(command: AppCommands, cfg: &Config) -> Result<()> {
    match command {
        AppCommands::List => {
            let found = apps::list_apps(cfg)?;
            let out = apps::format_app_list(&apps::apps_dir(cfg), &found);
            print!("{out}");
        }
    }
    Ok(())
}

fn detailed_version() -> String {
    let version = env!("CARGO_PKG_VERSION");
    let revision = option_env!("SYFTBOX_REVISION").unwrap_or("HEAD");
    let build_date = option_env!("SYFTBOX_BUILD_DATE").unwrap_or("");
    format!(
        "{} ({}; rust; {}/{}; {})",
        version,
        revision,
        std::env::consts::OS,
        std::env::consts::ARCH,
        build_date
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cli_allows_no_subcommand() {
        let cli = Cli::try_parse_from(["syftbox"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn server_cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "syftbox",
            "server",
            "-a",
            "127.0.0.1:9000",
            "--snapshot-root",
            "/tmp/snap",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Server { addr, snapshot_root }) => {
                assert_eq!(addr, "127.0.0.1:9000");
                assert_eq!(snapshot_root, Some(PathBuf::from("/tmp/snap")));
            }
            _ => panic!("expected server command"),
        }
    }

    #[test]
    fn app_list_cli_parses() {
        let cli = Cli::try_parse_from(["syftbox", "app", "list"]).unwrap();
        match cli.command {
            Some(Commands::App {
                command: AppCommands::List,
            }) => {}
            _ => panic!("expected app list command"),
        }
    }

    #[test]
    fn daemon_cli_parses_as_default() {
        let cli = Cli::try_parse_from(["syftbox", "daemon"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Daemon)));
    }
}
