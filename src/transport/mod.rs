// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Remote executor — ssh, scp and rsync against a fleet host
//!
//! Every operation runs as the administrative account and blocks until the
//! underlying process exits. The timeout bounds connection establishment
//! only; a slow transfer is not interrupted.
//!
//! Nothing here retries. Callers decide what a failure means.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(test)]
pub mod fake;

/// Account used for every remote operation
pub const ADMIN_USER: &str = "root";

/// Connection timeout used when the configuration does not set one
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {code}: {stderr}")]
    Exit {
        program: &'static str,
        code: String,
        stderr: String,
    },
    #[error("copied file {0} is missing or empty")]
    EmptyCopy(String),
    #[error("cannot quote argument for the remote shell: {0}")]
    Quote(String),
    #[error("local I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Which host to reach and how
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub key_path: PathBuf,
    pub timeout_secs: u64,
}

impl SshTarget {
    pub fn new(host: &str, key_path: &Path, timeout_secs: u64) -> Self {
        Self {
            host: host.to_string(),
            key_path: key_path.to_path_buf(),
            timeout_secs,
        }
    }

    fn login(&self) -> String {
        format!("{}@{}", ADMIN_USER, self.host)
    }

    fn remote_spec(&self, path: &str) -> String {
        format!("{}:{}", self.login(), path)
    }

    fn ssh_options(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key_path.to_string_lossy().to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.timeout_secs),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ]
    }
}

/// The primitives the orchestrators need from a remote host.
///
/// `run_command` succeeds whenever the remote exit status is zero, including
/// when the command printed nothing. An empty `Ok` is a valid answer.
pub trait Transport {
    fn run_command(&self, target: &SshTarget, command: &str) -> Result<String, TransportError>;

    /// Fetch exactly one file. Fails when the copy lands empty.
    fn copy_file_from_remote(
        &self,
        target: &SshTarget,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), TransportError>;

    fn copy_file_to_remote(
        &self,
        target: &SshTarget,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), TransportError>;

    /// Mirror a remote tree into `local_path`, deleting local extras.
    fn sync_tree_pull(
        &self,
        target: &SshTarget,
        remote_path: &str,
        local_path: &Path,
        exclude: &[&str],
    ) -> Result<(), TransportError>;

    /// Mirror a local tree onto `remote_path`, deleting remote extras.
    fn sync_tree_push(
        &self,
        target: &SshTarget,
        local_path: &Path,
        remote_path: &str,
        exclude: &[&str],
    ) -> Result<(), TransportError>;
}

/// Quote a single argument for interpolation into a remote shell command
pub fn quote(arg: &str) -> Result<String, TransportError> {
    shlex::try_quote(arg)
        .map(|q| q.into_owned())
        .map_err(|_| TransportError::Quote(arg.to_string()))
}

/// Ensure a path ends in `/` so rsync treats it as "contents of"
pub fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

// ─── SSH Implementation ───

/// Shells out to the system `ssh`, `scp` and `rsync` binaries
#[derive(Debug, Default, Clone, Copy)]
pub struct SshTransport;

impl SshTransport {
    fn exec(program: &'static str, args: &[String]) -> Result<String, TransportError> {
        debug!("{} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| TransportError::Spawn { program, source })?;

        if !output.status.success() {
            return Err(TransportError::Exit {
                program,
                code: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    fn rsync_args(
        target: &SshTarget,
        source: String,
        dest: String,
        exclude: &[&str],
    ) -> Result<Vec<String>, TransportError> {
        let mut remote_shell = vec!["ssh".to_string()];
        for opt in target.ssh_options() {
            remote_shell.push(quote(&opt)?);
        }

        let mut args = vec![
            "-az".to_string(),
            "--delete".to_string(),
            "-e".to_string(),
            remote_shell.join(" "),
        ];
        for pattern in exclude {
            args.push("--exclude".to_string());
            args.push(pattern.to_string());
        }
        args.push(source);
        args.push(dest);
        Ok(args)
    }
}

impl Transport for SshTransport {
    fn run_command(&self, target: &SshTarget, command: &str) -> Result<String, TransportError> {
        let mut args = target.ssh_options();
        args.push(target.login());
        args.push(command.to_string());

        Self::exec("ssh", &args).inspect_err(|e| {
            warn!("Command on {} failed ({}): {}", target.host, command, e);
        })
    }

    fn copy_file_from_remote(
        &self,
        target: &SshTarget,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), TransportError> {
        // Scratch file is removed on drop whatever happens below
        let scratch = tempfile::NamedTempFile::new().map_err(|source| TransportError::Io {
            path: "scratch file".to_string(),
            source,
        })?;

        let mut args = target.ssh_options();
        args.push(target.remote_spec(remote_path));
        args.push(scratch.path().to_string_lossy().to_string());

        if let Err(e) = Self::exec("scp", &args) {
            warn!("Copy {}:{} failed: {}", target.host, remote_path, e);
            return Err(e);
        }

        let size = fs::metadata(scratch.path()).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            warn!("Copy {}:{} produced an empty file", target.host, remote_path);
            return Err(TransportError::EmptyCopy(remote_path.to_string()));
        }

        fs::copy(scratch.path(), local_path).map_err(|source| TransportError::Io {
            path: local_path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    fn copy_file_to_remote(
        &self,
        target: &SshTarget,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), TransportError> {
        let mut args = target.ssh_options();
        args.push(local_path.to_string_lossy().to_string());
        args.push(target.remote_spec(remote_path));

        Self::exec("scp", &args).map(|_| ()).inspect_err(|e| {
            warn!("Upload {} to {}:{} failed: {}", local_path.display(), target.host, remote_path, e);
        })
    }

    fn sync_tree_pull(
        &self,
        target: &SshTarget,
        remote_path: &str,
        local_path: &Path,
        exclude: &[&str],
    ) -> Result<(), TransportError> {
        let args = Self::rsync_args(
            target,
            target.remote_spec(&with_trailing_slash(remote_path)),
            local_path.to_string_lossy().to_string(),
            exclude,
        )?;

        Self::exec("rsync", &args).map(|_| ()).inspect_err(|e| {
            warn!("Sync {}:{} -> {} failed: {}", target.host, remote_path, local_path.display(), e);
        })
    }

    fn sync_tree_push(
        &self,
        target: &SshTarget,
        local_path: &Path,
        remote_path: &str,
        exclude: &[&str],
    ) -> Result<(), TransportError> {
        let args = Self::rsync_args(
            target,
            with_trailing_slash(&local_path.to_string_lossy()),
            target.remote_spec(&with_trailing_slash(remote_path)),
            exclude,
        )?;

        Self::exec("rsync", &args).map(|_| ()).inspect_err(|e| {
            warn!("Sync {} -> {}:{} failed: {}", local_path.display(), target.host, remote_path, e);
        })
    }
}
