// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Restore — replay a server backup onto a target host
//!
//! Preconditions are checked before anything is touched: the backup exists,
//! the key exists, the host answers a probe. After that every step is
//! attempted in a fixed order (system, services, users) and failures are
//! recorded rather than raised.

use chrono::Local;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup::{HOME_EXCLUDES, SYSTEM_EXCLUDES};
use crate::config::DEFAULT_SSH_KEY;
use crate::outcome::{RunLedger, StepOutcome};
use crate::recipes::{RecipeBook, RestoreRecipe};
use crate::snapshot::{
    self, DISPLAY_TIME_FORMAT, FILES_DIR, HOMES_DIR, RESTORE_LOG_FILE, SERVICES_DIR, SYSTEM_DIR,
};
use crate::transport::{SshTarget, Transport, TransportError, quote, with_trailing_slash};

/// Connectivity probe run before any change is made
pub const PROBE_COMMAND: &str = "echo ok";

/// System subtrees pushed back, as (path below `system/`, remote path)
const SYSTEM_RESTORE_PATHS: &[(&str, &str)] = &[("etc", "/etc/"), ("var/spool/cron", "/var/spool/cron/")];

const STAGING_DIR: &str = "/tmp";

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("backup directory {0} does not exist")]
    MissingBackup(String),
    #[error("{path} holds {count} server backups, pass one server directory")]
    Ambiguous { path: String, count: usize },
    #[error("SSH key {0} does not exist")]
    MissingKey(String),
    #[error("cannot reach {host}: {source}")]
    Unreachable {
        host: String,
        #[source]
        source: TransportError,
    },
    #[error("cannot open restore log {path}: {source}")]
    Log {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Key file name inside `key_dir`; defaults to `id_rsa`
    pub ssh_key: Option<String>,
    pub key_dir: PathBuf,
    pub timeout_secs: u64,
}

impl RestoreOptions {
    pub fn key_path(&self) -> PathBuf {
        let name = self.ssh_key.as_deref().filter(|k| !k.is_empty()).unwrap_or(DEFAULT_SSH_KEY);
        self.key_dir.join(name)
    }
}

/// What a completed restore attempted
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub server_dir: PathBuf,
    pub log_path: PathBuf,
    pub services: Vec<String>,
    pub users: Vec<String>,
    pub ledger: RunLedger,
}

// ─── Restore Log ───

/// `restore_log.txt`: header, one timestamped line per step, footer
pub struct RestoreLog {
    path: PathBuf,
    file: File,
}

impl RestoreLog {
    pub fn open(server_dir: &Path, target_ip: &str) -> Result<Self, RestoreError> {
        let path = server_dir.join(RESTORE_LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| RestoreError::Log {
                path: path.display().to_string(),
                source,
            })?;

        let mut log = Self { path, file };
        log.raw(&format!(
            "Restore started: {}\nTarget server: {}\nBackup directory: {}\n\n",
            Local::now().format(DISPLAY_TIME_FORMAT),
            target_ip,
            server_dir.display()
        ));
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn raw(&mut self, text: &str) {
        if let Err(e) = self.file.write_all(text.as_bytes()) {
            warn!("Failed to write {}: {}", self.path.display(), e);
        }
    }

    /// Timestamped line in the file only
    pub fn append(&mut self, message: &str) {
        let line = format!("[{}] {}\n", Local::now().format(DISPLAY_TIME_FORMAT), message);
        self.raw(&line);
    }

    /// Timestamped line in the file, narrated as well
    pub fn note(&mut self, message: &str) {
        info!("{}", message);
        self.append(message);
    }

    fn footer(&mut self, services: &[String], users: &[String], failures: usize) {
        self.raw(&format!(
            "\nRestore completed: {}\nServices restored: {}\nUsers restored: {}\nFailed steps: {}\n",
            Local::now().format(DISPLAY_TIME_FORMAT),
            services.join(", "),
            users.join(", "),
            failures
        ));
    }
}

// ─── Preconditions ───

/// Accept a server directory, or a run root holding exactly one
pub fn resolve_server_dir(backup_dir: &Path) -> Result<PathBuf, RestoreError> {
    if !backup_dir.is_dir() {
        return Err(RestoreError::MissingBackup(backup_dir.display().to_string()));
    }
    let is_server_dir = backup_dir
        .file_name()
        .and_then(|n| snapshot::parse_server_dir_name(&n.to_string_lossy()))
        .is_some();
    if is_server_dir {
        return Ok(backup_dir.to_path_buf());
    }

    let mut found = snapshot::find_server_dirs(backup_dir);
    match found.len() {
        0 => Ok(backup_dir.to_path_buf()),
        1 => Ok(found.remove(0).2),
        count => Err(RestoreError::Ambiguous {
            path: backup_dir.display().to_string(),
            count,
        }),
    }
}

// ─── Session ───

struct Session<'a> {
    transport: &'a dyn Transport,
    target: SshTarget,
    recipes: &'a RecipeBook,
    log: RestoreLog,
    ledger: RunLedger,
}

impl Session<'_> {
    fn track<E: Display>(&mut self, step: String, result: Result<(), E>) -> bool {
        match &result {
            Ok(()) => self.log.append(&format!("{}: ok", step)),
            Err(e) => self.log.append(&format!("{}: FAILED ({})", step, e)),
        }
        self.ledger.track(step, result)
    }

    fn skip(&mut self, step: String, reason: &str) {
        self.log.append(&format!("{}: skipped ({})", step, reason));
        self.ledger.record(step, StepOutcome::Skipped(reason.to_string()));
    }

    fn run(&mut self, step: String, command: &str) -> bool {
        let result = self.transport.run_command(&self.target, command).map(|_| ());
        self.track(step, result)
    }

    fn push(&mut self, local: &Path, remote: &str, exclude: &[&str]) -> bool {
        let result = self.transport.sync_tree_push(&self.target, local, remote, exclude);
        self.track(format!("push {}", remote), result)
    }

    /// Copy one file into place through a uniquely named staging file
    fn stage_file(&mut self, local: &Path, destination: &str) -> bool {
        let result = stage_file(self.transport, &self.target, local, destination);
        self.track(format!("place {}", destination), result)
    }

    // ─── System ───

    fn restore_system(&mut self, server_dir: &Path) {
        let system_dir = server_dir.join(SYSTEM_DIR);
        if !system_dir.is_dir() {
            self.log.note("System backup not found, skipping system restore");
            self.ledger.record("system", StepOutcome::Skipped("no system backup".to_string()));
            return;
        }

        self.log.note("Restoring system configuration");
        for (rel, remote) in SYSTEM_RESTORE_PATHS {
            let local = system_dir.join(rel);
            if local.is_dir() {
                self.push(&local, remote, SYSTEM_EXCLUDES);
            } else {
                self.skip(format!("push {}", remote), "not in backup");
            }
        }
    }

    // ─── Services ───

    fn restore_service(&mut self, service: &str, service_dir: &Path) {
        self.log.note(&format!("Restoring service: {}", service));
        let recipe = self.recipes.restore(service);
        let files_dir = service_dir.join(FILES_DIR);

        if let Some(command) = recipe.and_then(|r| r.pre_restore_command) {
            self.run(format!("{} pre-restore", service), command);
        }

        match recipe {
            Some(recipe) => {
                for path in recipe.paths {
                    let local = files_dir.join(path.trim_matches('/'));
                    if local.is_dir() {
                        self.push(&local, path, &[]);
                    } else {
                        self.skip(format!("push {}", path), "not in backup");
                    }
                }
            }
            None => {
                // No recipe: each top-level directory goes back to the root path of the same name
                let tops = snapshot::list_subdirs(&files_dir);
                if tops.is_empty() {
                    self.skip(format!("{} files", service), "nothing backed up");
                }
                for top in tops {
                    self.push(&files_dir.join(&top), &format!("/{}/", top), &[]);
                }
            }
        }

        for placement in recipe.map(|r| r.files).unwrap_or_default() {
            let local = service_dir.join(placement.source);
            if local.is_file() {
                self.stage_file(&local, placement.destination);
            } else {
                self.skip(format!("place {}", placement.destination), "not in backup");
            }
        }

        self.ensure_installed(service, recipe);

        match recipe {
            Some(RestoreRecipe {
                post_restore_command: Some(command),
                ..
            }) => {
                self.run(format!("{} post-restore", service), command);
            }
            Some(RestoreRecipe {
                restart_command: Some(command),
                ..
            }) => {
                self.run(format!("{} restart", service), command);
            }
            _ => {}
        }
    }

    /// Install the service's package when its binary is missing
    fn ensure_installed(&mut self, service: &str, recipe: Option<&RestoreRecipe>) {
        let (binary, apt, yum) = match recipe {
            Some(r) => (r.binary, r.apt_package, r.yum_package),
            None => (service, service, service),
        };
        let step = format!("{} install", service);

        let (binary, apt, yum) = match (quote(binary), quote(apt), quote(yum)) {
            (Ok(b), Ok(a), Ok(y)) => (b, a, y),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                self.track(step, Err(e));
                return;
            }
        };

        if self.present(&binary) {
            return;
        }

        let install = if self.present("apt-get") {
            format!("apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y {}", apt)
        } else if self.present("yum") {
            format!("yum install -y {}", yum)
        } else {
            self.skip(step, "no supported package manager");
            return;
        };
        self.log.note(&format!("Installing {}", service));
        self.run(step, &install);
    }

    /// Exit status of `command -v` decides presence
    fn present(&self, binary: &str) -> bool {
        self.transport
            .run_command(&self.target, &format!("command -v {}", binary))
            .is_ok()
    }

    // ─── Users ───

    fn restore_user(&mut self, username: &str, local_home: &Path) {
        self.log.note(&format!("Restoring user: {}", username));
        let user = match quote(username) {
            Ok(q) => q,
            Err(e) => {
                self.track(format!("user {}", username), Err(e));
                return;
            }
        };

        let ensure = format!("id -u {0} >/dev/null 2>&1 || useradd -m {0}", user);
        if !self.run(format!("user {}", username), &ensure) {
            return;
        }

        let lookup = format!("getent passwd {} | cut -d: -f6", user);
        let home = match self.transport.run_command(&self.target, &lookup) {
            Ok(out) if !out.trim().is_empty() => out.trim().to_string(),
            _ if username == "root" => "/root".to_string(),
            _ => format!("/home/{}", username),
        };
        self.push(local_home, &with_trailing_slash(&home), HOME_EXCLUDES);
    }
}

/// Upload to `/tmp/ibr-<uuid>-<name>`, then move into place
pub fn stage_file(
    transport: &dyn Transport,
    target: &SshTarget,
    local: &Path,
    destination: &str,
) -> Result<(), TransportError> {
    let dest = Path::new(destination);
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    let staged = format!("{}/ibr-{}-{}", STAGING_DIR, Uuid::new_v4(), name);

    transport.copy_file_to_remote(target, local, &staged)?;
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        transport.run_command(target, &format!("mkdir -p {}", quote(&parent.to_string_lossy())?))?;
    }
    transport.run_command(target, &format!("mv {} {}", quote(&staged)?, quote(destination)?))?;
    Ok(())
}

// ─── Orchestration ───

/// Replay `backup_dir` onto `target_ip`.
///
/// Errors only when a precondition fails, in which case nothing has been
/// changed locally or remotely. Step failures are in the report's ledger.
pub fn restore_server(
    transport: &dyn Transport,
    recipes: &RecipeBook,
    backup_dir: &Path,
    target_ip: &str,
    options: &RestoreOptions,
) -> Result<RestoreReport, RestoreError> {
    let server_dir = resolve_server_dir(backup_dir)?;

    let key_path = options.key_path();
    if !key_path.is_file() {
        return Err(RestoreError::MissingKey(key_path.display().to_string()));
    }

    let target = SshTarget::new(target_ip, &key_path, options.timeout_secs);
    info!("Checking connectivity to {}", target_ip);
    transport
        .run_command(&target, PROBE_COMMAND)
        .map_err(|source| RestoreError::Unreachable {
            host: target_ip.to_string(),
            source,
        })?;

    info!("Restoring {} to {}", server_dir.display(), target_ip);
    let log = RestoreLog::open(&server_dir, target_ip)?;
    let mut session = Session {
        transport,
        target,
        recipes,
        log,
        ledger: RunLedger::new(),
    };

    session.restore_system(&server_dir);

    let services_dir = server_dir.join(SERVICES_DIR);
    let services = snapshot::list_subdirs(&services_dir);
    for service in &services {
        session.restore_service(service, &services_dir.join(service));
    }

    let homes_dir = server_dir.join(HOMES_DIR);
    let users = snapshot::list_subdirs(&homes_dir);
    for user in &users {
        session.restore_user(user, &homes_dir.join(user));
    }

    let failures = session.ledger.failures();
    session.log.footer(&services, &users, failures);
    info!(
        "Restore to {} completed: {} services, {} users, {} failed steps",
        target_ip,
        services.len(),
        users.len(),
        failures
    );

    Ok(RestoreReport {
        server_dir,
        log_path: session.log.path().to_path_buf(),
        services,
        users,
        ledger: session.ledger,
    })
}
