// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! vps-ibr — Inventory, Backup and Restore for a fleet of VPS hosts
//!
//! Three separate runs, each driven over SSH as root:
//! - `inventory` records accounts and shell histories per server
//! - `backup` mines the newest inventory for services, then saves service
//!   data, home directories and system configuration
//! - `restore` replays one server backup onto a target host

mod backup;
mod config;
mod history;
mod inventory;
mod outcome;
mod recipes;
mod restore;
mod snapshot;
mod transport;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use recipes::RecipeBook;
use transport::{DEFAULT_TIMEOUT_SECS, SshTransport};

/// vps-ibr — VPS inventory, backup and restore over SSH
#[derive(Parser)]
#[command(name = "vps-ibr", version, about = "Inventory, back up and restore VPS hosts over SSH")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record users, privileged users and shell histories of every server
    Inventory {
        /// YAML server list
        #[arg(short, long)]
        config: PathBuf,

        /// Run directory (default: <backup_root>/ibr-<timestamp>)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Back up services, home directories and system configuration
    Backup {
        /// YAML server list
        #[arg(short, long)]
        config: PathBuf,

        /// Only back up the server with this IP
        #[arg(short, long)]
        server: Option<String>,

        /// Run directory (default: <backup_root>/ibr-<timestamp>)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replay one server backup onto a target host
    Restore {
        /// Server backup directory, or a run directory holding exactly one
        #[arg(short, long)]
        backup_dir: PathBuf,

        /// Target host IP
        #[arg(short, long)]
        target: String,

        /// Key file name inside --key-dir
        #[arg(short = 'k', long)]
        ssh_key: Option<String>,

        /// Directory holding SSH keys
        #[arg(long, default_value = "~/.ssh")]
        key_dir: PathBuf,

        /// Connection timeout in seconds
        #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
        timeout: u64,
    },
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vps_ibr=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let transport = SshTransport;
    let recipes = RecipeBook::builtin();

    match cli.command {
        Command::Inventory { config, output } => {
            let config = match config::load_config(&config) {
                Ok(c) => c,
                Err(e) => {
                    error!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            match inventory::create_inventory(&transport, &config, output.as_deref()) {
                Ok(path) => {
                    info!("Inventory completed: {}", path.display());
                    println!("{}", path.display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("Inventory failed: {}", e);
                    ExitCode::FAILURE
                }
            }
        }

        Command::Backup { config, server, output } => {
            let config = match config::load_config(&config) {
                Ok(c) => c,
                Err(e) => {
                    error!("{}", e);
                    return ExitCode::FAILURE;
                }
            };
            match backup::create_backup(&transport, &config, &recipes, server.as_deref(), output.as_deref()) {
                Ok(path) => {
                    info!("Backup completed: {}", path.display());
                    println!("{}", path.display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("Backup failed: {}", e);
                    ExitCode::FAILURE
                }
            }
        }

        Command::Restore { backup_dir, target, ssh_key, key_dir, timeout } => {
            let options = restore::RestoreOptions {
                ssh_key,
                key_dir: config::expand_home(&key_dir),
                timeout_secs: timeout,
            };
            match restore::restore_server(&transport, &recipes, &backup_dir, &target, &options) {
                Ok(report) => {
                    info!("Restore log: {}", report.log_path.display());
                    if report.ledger.failures() > 0 {
                        info!("{} steps failed, see the restore log for details", report.ledger.failures());
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("Restore aborted: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}
