// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Inventory — accounts, privileged users and shell histories per server
//!
//! Produces `<run>/<ip>-<date>/users/<name>/bash_history` for every account
//! that has one, which later backup runs mine for services.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{IbrConfig, Server};
use crate::history;
use crate::snapshot::{self, ANALYSIS_FILE, HISTORY_FILE, RunError, SUDO_USERS_FILE, USERS_DIR};
use crate::transport::{SshTarget, Transport};

/// Regular accounts: uid >= 1000, excluding `nobody`
pub const LIST_USERS_COMMAND: &str =
    "awk -F: '$3 >= 1000 && $3 != 65534 {print $1 \":\" $6}' /etc/passwd";

/// Members of the administrative groups, one comma-separated line per group
pub const ADMIN_GROUP_COMMAND: &str = "getent group sudo wheel | cut -d: -f4";

/// Sudoers entries granting unrestricted privilege
pub const SUDOERS_COMMAND: &str =
    "grep -v '^#' /etc/sudoers | grep -v '^Defaults' | grep 'ALL=(ALL:ALL)' | cut -d' ' -f1";

const GROUP_MARKER: char = '%';

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub home_directory: String,
}

impl User {
    pub fn admin() -> Self {
        Self {
            username: "root".to_string(),
            home_directory: "/root".to_string(),
        }
    }
}

// ─── Parsing ───

/// Parse `name:home` lines, then append the administrative account once
pub fn parse_user_listing(output: &str) -> Vec<User> {
    let admin = User::admin();
    let mut users: Vec<User> = output
        .lines()
        .filter_map(|line| {
            let (name, home) = line.trim().split_once(':')?;
            let (name, home) = (name.trim(), home.trim());
            if name.is_empty() || home.is_empty() || name == admin.username {
                return None;
            }
            Some(User {
                username: name.to_string(),
                home_directory: home.to_string(),
            })
        })
        .collect();
    users.push(admin);
    users
}

/// Union of administrative group members and single-user sudoers grants
pub fn parse_sudo_users(group_output: &str, sudoers_output: &str) -> BTreeSet<String> {
    let members = group_output
        .lines()
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|u| !u.is_empty());

    let grants = sudoers_output
        .lines()
        .map(str::trim)
        .filter(|u| !u.is_empty() && !u.starts_with(GROUP_MARKER));

    members.chain(grants).map(str::to_string).collect()
}

// ─── Remote Queries ───

/// Accounts on the host; the administrative account is always present
pub fn get_users(transport: &dyn Transport, target: &SshTarget) -> Vec<User> {
    let output = transport
        .run_command(target, LIST_USERS_COMMAND)
        .unwrap_or_else(|e| {
            warn!("  Could not enumerate users on {}: {}", target.host, e);
            String::new()
        });
    parse_user_listing(&output)
}

pub fn get_sudo_users(transport: &dyn Transport, target: &SshTarget) -> BTreeSet<String> {
    // grep exits 1 on no match; either way there is nothing to add
    let group = transport.run_command(target, ADMIN_GROUP_COMMAND).unwrap_or_default();
    let sudoers = transport.run_command(target, SUDOERS_COMMAND).unwrap_or_default();
    parse_sudo_users(&group, &sudoers)
}

/// Fetch one account's history into `users/<name>/bash_history`
pub fn copy_bash_history(
    transport: &dyn Transport,
    target: &SshTarget,
    user: &User,
    server_dir: &Path,
) -> bool {
    let user_dir = server_dir.join(USERS_DIR).join(&user.username);
    if let Err(e) = fs::create_dir_all(&user_dir) {
        warn!("  - Cannot create {}: {}", user_dir.display(), e);
        return false;
    }

    let remote = format!("{}/.bash_history", user.home_directory.trim_end_matches('/'));
    match transport.copy_file_from_remote(target, &remote, &user_dir.join(HISTORY_FILE)) {
        Ok(()) => {
            info!("  - Copied bash history for user {}", user.username);
            true
        }
        Err(e) => {
            info!("  - Could not copy bash history for user {}: {}", user.username, e);
            false
        }
    }
}

// ─── Collection ───

/// Inventory one server into `run_root`; returns the server directory
pub fn collect_server(
    transport: &dyn Transport,
    config: &IbrConfig,
    server: &Server,
    run_root: &Path,
) -> Result<PathBuf, RunError> {
    let ip = server.ip();
    let target = config.target(server);
    info!("Processing server: {} ({})", ip, server.description());
    info!("Using SSH key: {}", target.key_path.display());

    let server_dir = snapshot::create_server_dir(run_root, ip).map_err(|source| RunError::CreateDir {
        path: run_root.display().to_string(),
        source,
    })?;
    if let Err(e) = snapshot::write_server_info(&server_dir, ip, server.description(), "Inventory Date") {
        warn!("  {}", e);
    }
    let users_dir = server_dir.join(USERS_DIR);
    fs::create_dir_all(&users_dir).map_err(|source| RunError::CreateDir {
        path: users_dir.display().to_string(),
        source,
    })?;

    info!("  Getting list of users...");
    let users = get_users(transport, &target);

    let sudo_users = get_sudo_users(transport, &target);
    let listing: String = sudo_users.iter().map(|u| format!("{}\n", u)).collect();
    if let Err(e) = fs::write(server_dir.join(SUDO_USERS_FILE), listing) {
        warn!("  Failed to write {}: {}", SUDO_USERS_FILE, e);
    }

    info!("  Copying bash history files...");
    for user in &users {
        copy_bash_history(transport, &target, user, &server_dir);
    }

    let analysis = history::analyze_server_dir(&server_dir);
    if !analysis.services.is_empty() {
        info!("  Detected services: {}", analysis.services.iter().cloned().collect::<Vec<_>>().join(", "));
    }
    if let Err(e) = snapshot::write_json(&server_dir.join(ANALYSIS_FILE), &analysis) {
        warn!("  {}", e);
    }

    info!("  Inventory collected successfully.");
    Ok(server_dir)
}

/// Inventory every configured server; returns the run root
pub fn create_inventory(
    transport: &dyn Transport,
    config: &IbrConfig,
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

    for server in &config.servers {
        if server.ip().is_empty() {
            warn!("Server missing IP address, skipping.");
            continue;
        }
        if let Err(e) = collect_server(transport, config, server, &run_root) {
            warn!("Inventory of {} failed: {}", server.ip(), e);
        }
    }

    Ok(run_root)
}
