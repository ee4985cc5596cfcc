// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Backup — services, home directories and system configuration
//!
//! Services to back up come from the newest inventory of the host, if any.
//! Homes and system paths are always taken. The summary at the end is built
//! from what is on disk, so a partly failed run still describes itself
//! accurately.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{IbrConfig, Server};
use crate::history;
use crate::inventory;
use crate::outcome::{RunLedger, StepOutcome, StepRecord};
use crate::recipes::{BackupRecipe, RecipeBook};
use crate::snapshot::{
    self, ANALYSIS_FILE, DISPLAY_TIME_FORMAT, FILES_DIR, HOMES_DIR, RunError, SERVICES_DIR,
    SUMMARY_JSON_FILE, SUMMARY_TEXT_FILE, SYSTEM_DIR,
};
use crate::transport::{SshTarget, Transport, quote};

/// Directories skipped inside home directories
pub const HOME_EXCLUDES: &[&str] = &[
    ".cache",
    "node_modules",
    ".venv",
    "venv",
    "env",
    "__pycache__",
    "tmp",
    "temp",
];

const SYSTEM_PATHS: &[&str] = &["/etc/", "/var/spool/cron/", "/var/log/"];

/// Rotated, compressed and backup copies
pub const SYSTEM_EXCLUDES: &[&str] = &["*.gz", "*.xz", "*.bz2", "*.old", "*.bak", "*.[0-9]", "*.[0-9].log"];

const SYSTEM_COMMANDS: &[&str] = &[
    "uname -a",
    "lsb_release -a",
    "df -h",
    "free -m",
    "netstat -tulpn",
    "ss -tulpn",
    "ps aux",
    "dpkg -l",
    "rpm -qa",
    "systemctl list-units --type=service",
    "systemctl list-unit-files --state=enabled",
    "ifconfig -a",
    "ip addr",
];

// ─── Data Types ───

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSummary {
    pub backup_date: String,
    pub services: Vec<String>,
    pub users: Vec<String>,
    pub backup_size_bytes: u64,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

// ─── Helpers ───

/// Output file stem: the command words before the first option or shell operator
pub fn command_output_name(command: &str) -> String {
    let words: Vec<&str> = command
        .split_whitespace()
        .take_while(|w| !w.starts_with('-') && !w.chars().any(|c| "<>|&;".contains(c)))
        .collect();
    let stem = if words.is_empty() {
        command.split_whitespace().next().unwrap_or("command").to_string()
    } else {
        words.join("_")
    };
    format!("{}_output.txt", stem.replace(['-', '/', '.'], "_"))
}

/// Where a remote absolute path lands below `base`
fn local_mirror(base: &Path, remote_path: &str) -> PathBuf {
    base.join(remote_path.trim_start_matches('/'))
}

fn pull_into(
    transport: &dyn Transport,
    target: &SshTarget,
    ledger: &mut RunLedger,
    remote_path: &str,
    local_path: &Path,
    exclude: &[&str],
) {
    if let Some(parent) = local_path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            ledger.record(format!("pull {}", remote_path), StepOutcome::Failed(e.to_string()));
            return;
        }
    }
    let result = transport.sync_tree_pull(target, remote_path, local_path, exclude);
    ledger.track(format!("pull {}", remote_path), result);
}

/// Run a command and keep its output, even when empty
fn capture_command(
    transport: &dyn Transport,
    target: &SshTarget,
    ledger: &mut RunLedger,
    command: &str,
    dir: &Path,
) {
    let step = format!("run {}", command);
    let result = transport
        .run_command(target, command)
        .map_err(|e| e.to_string())
        .and_then(|output| {
            let path = dir.join(command_output_name(command));
            fs::write(&path, output).map_err(|e| format!("Failed to write {}: {}", path.display(), e))
        });
    ledger.track(step, result);
}

// ─── Backup Steps ───

/// Back up one service according to its recipe
pub fn backup_service(
    transport: &dyn Transport,
    target: &SshTarget,
    service: &str,
    recipe: &BackupRecipe,
    server_dir: &Path,
    ledger: &mut RunLedger,
) {
    info!("  Backing up service: {}", service);
    let service_dir = server_dir.join(SERVICES_DIR).join(service);
    if let Err(e) = fs::create_dir_all(&service_dir) {
        ledger.record(format!("service {}", service), StepOutcome::Failed(e.to_string()));
        return;
    }
    let files_dir = service_dir.join(FILES_DIR);

    for path in recipe.paths {
        info!("    Backing up path: {}", path);
        pull_into(transport, target, ledger, path, &local_mirror(&files_dir, path), &[]);
    }

    for command in recipe.commands {
        info!("    Running command: {}", command);
        capture_command(transport, target, ledger, command, &service_dir);
    }

    for remote_file in recipe.files {
        info!("    Backing up file: {}", remote_file);
        let name = Path::new(remote_file)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| remote_file.to_string());
        let step = format!("fetch {}", remote_file);
        if let Err(e) = fs::create_dir_all(&files_dir) {
            ledger.record(step, StepOutcome::Failed(e.to_string()));
            continue;
        }
        let fetched = transport.copy_file_from_remote(target, remote_file, &files_dir.join(&name));
        if !ledger.track(step, fetched) {
            // Keep the only copy on the host
            ledger.record(
                format!("remove {}", remote_file),
                StepOutcome::Skipped("fetch failed".to_string()),
            );
            continue;
        }

        // Dumps are scratch files; never leave them behind on the host
        let cleanup = quote(remote_file)
            .and_then(|q| transport.run_command(target, &format!("rm -f {}", q)))
            .map(|_| ());
        ledger.track(format!("remove {}", remote_file), cleanup);
    }
}

pub fn backup_user_homes(
    transport: &dyn Transport,
    target: &SshTarget,
    server_dir: &Path,
    ledger: &mut RunLedger,
) {
    info!("  Backing up user home directories");
    let homes_dir = server_dir.join(HOMES_DIR);
    if let Err(e) = fs::create_dir_all(&homes_dir) {
        ledger.record("homes", StepOutcome::Failed(e.to_string()));
        return;
    }

    for user in inventory::get_users(transport, target) {
        info!("    Backing up home directory for user: {}", user.username);
        let local = homes_dir.join(&user.username);
        if let Err(e) = fs::create_dir_all(&local) {
            ledger.record(format!("home {}", user.username), StepOutcome::Failed(e.to_string()));
            continue;
        }
        let remote = crate::transport::with_trailing_slash(&user.home_directory);
        let result = transport.sync_tree_pull(target, &remote, &local, HOME_EXCLUDES);
        ledger.track(format!("home {}", user.username), result);
    }
}

pub fn backup_system_configs(
    transport: &dyn Transport,
    target: &SshTarget,
    server_dir: &Path,
    ledger: &mut RunLedger,
) {
    info!("  Backing up system configuration files");
    let system_dir = server_dir.join(SYSTEM_DIR);
    if let Err(e) = fs::create_dir_all(&system_dir) {
        ledger.record("system", StepOutcome::Failed(e.to_string()));
        return;
    }

    for path in SYSTEM_PATHS {
        info!("    Backing up system path: {}", path);
        pull_into(transport, target, ledger, path, &local_mirror(&system_dir, path), SYSTEM_EXCLUDES);
    }

    for command in SYSTEM_COMMANDS {
        capture_command(transport, target, ledger, command, &system_dir);
    }
}

// ─── Summary ───

/// Describe what actually landed in `server_dir`
pub fn build_summary(server_dir: &Path, ledger: &RunLedger) -> BackupSummary {
    BackupSummary {
        backup_date: Local::now().format(DISPLAY_TIME_FORMAT).to_string(),
        services: snapshot::list_subdirs(&server_dir.join(SERVICES_DIR)),
        users: snapshot::list_subdirs(&server_dir.join(HOMES_DIR)),
        backup_size_bytes: snapshot::dir_size(server_dir),
        steps: ledger.steps.clone(),
    }
}

pub fn render_summary(summary: &BackupSummary) -> String {
    let mut text = format!(
        "Backup Date: {}\n\nBackup Size: {}\n\nBacked Up Services:\n",
        summary.backup_date,
        snapshot::format_size(summary.backup_size_bytes)
    );
    for service in &summary.services {
        text.push_str(&format!("  - {}\n", service));
    }
    text.push_str("\nBacked Up Users:\n");
    for user in &summary.users {
        text.push_str(&format!("  - {}\n", user));
    }

    let failed: Vec<&StepRecord> = summary
        .steps
        .iter()
        .filter(|s| matches!(s.outcome, StepOutcome::Failed(_)))
        .collect();
    if !failed.is_empty() {
        text.push_str("\nFailed Steps:\n");
        for step in failed {
            text.push_str(&format!("  - {} ({})\n", step.step, step.outcome));
        }
    }
    text
}

pub fn write_summary(server_dir: &Path, ledger: &RunLedger) -> Result<BackupSummary, String> {
    let summary = build_summary(server_dir, ledger);
    snapshot::write_json(&server_dir.join(SUMMARY_JSON_FILE), &summary)?;
    let path = server_dir.join(SUMMARY_TEXT_FILE);
    fs::write(&path, render_summary(&summary))
        .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
    Ok(summary)
}

// ─── Orchestration ───

/// Back up one server into `run_root`; returns the server directory
pub fn backup_server(
    transport: &dyn Transport,
    config: &IbrConfig,
    recipes: &RecipeBook,
    server: &Server,
    run_root: &Path,
) -> Result<PathBuf, RunError> {
    let ip = server.ip();
    let target = config.target(server);
    info!("Backing up server: {} ({})", ip, server.description());
    info!("Using SSH key: {}", target.key_path.display());

    let server_dir = snapshot::create_server_dir(run_root, ip).map_err(|source| RunError::CreateDir {
        path: run_root.display().to_string(),
        source,
    })?;
    if let Err(e) = snapshot::write_server_info(&server_dir, ip, server.description(), "Backup Date") {
        warn!("  {}", e);
    }

    let mut ledger = RunLedger::new();

    let services: Vec<String> = match snapshot::find_latest_inventory(&config.global.backup_root, ip) {
        Some(inventory_dir) => {
            info!("Found existing inventory for {} at {}, using for targeted backup", ip, inventory_dir.display());
            let analysis = history::analyze_server_dir(&inventory_dir);
            if let Err(e) = snapshot::write_json(&server_dir.join(ANALYSIS_FILE), &analysis) {
                warn!("  {}", e);
            }
            analysis.services.into_iter().collect()
        }
        None => {
            info!("No existing inventory found for {}, performing basic backup", ip);
            Vec::new()
        }
    };

    for service in &services {
        match recipes.backup(service) {
            Some(recipe) => backup_service(transport, &target, service, recipe, &server_dir, &mut ledger),
            None => ledger.record(
                format!("service {}", service),
                StepOutcome::Skipped("no backup recipe".to_string()),
            ),
        }
    }

    backup_user_homes(transport, &target, &server_dir, &mut ledger);
    backup_system_configs(transport, &target, &server_dir, &mut ledger);

    match write_summary(&server_dir, &ledger) {
        Ok(summary) => info!(
            "Backup completed for {}: {} services, {} users, {} ({} failed steps)",
            ip,
            summary.services.len(),
            summary.users.len(),
            snapshot::format_size(summary.backup_size_bytes),
            ledger.failures()
        ),
        Err(e) => warn!("Backup completed for {} but the summary could not be written: {}", ip, e),
    }

    Ok(server_dir)
}

/// Back up all configured servers, or only `server_ip`; returns the run root
pub fn create_backup(
    transport: &dyn Transport,
    config: &IbrConfig,
    recipes: &RecipeBook,
    server_ip: Option<&str>,
    output_dir: Option<&Path>,
) -> Result<PathBuf, RunError> {
    let run_root = snapshot::create_run_root(&config.global.backup_root, output_dir).map_err(|source| {
        RunError::CreateDir {
            path: output_dir
                .unwrap_or(&config.global.backup_root)
                .display()
                .to_string(),
            source,
        }
    })?;

    debug!("Backup recipes: {}", recipes.backup_services().collect::<Vec<_>>().join(", "));

    let servers: Vec<&Server> = config
        .servers
        .iter()
        .filter(|s| server_ip.is_none_or(|ip| s.ip() == ip))
        .collect();

    if let Some(ip) = server_ip {
        if servers.is_empty() {
            warn!("Server with IP {} not found in configuration.", ip);
            return Ok(run_root);
        }
    }

    for server in servers {
        if server.ip().is_empty() {
            warn!("Server missing IP address, skipping.");
            continue;
        }
        if let Err(e) = backup_server(transport, config, recipes, server, &run_root) {
            warn!("Backup of {} failed: {}", server.ip(), e);
        }
    }

    Ok(run_root)
}
