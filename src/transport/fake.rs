// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! In-memory transport for exercising the orchestrators without a network.
//!
//! The remote host is a flat map of absolute file paths to contents. Tree
//! syncs copy every file under a prefix in either direction; commands are
//! answered from scripted responses matched by substring.

use super::{SshTarget, Transport, TransportError};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Run(String),
    CopyFrom(String),
    CopyTo(String),
    Pull(String),
    Push(String),
}

#[derive(Default)]
pub struct FakeTransport {
    responses: Vec<(String, Result<String, ()>)>,
    failing_paths: Vec<String>,
    remote: RefCell<BTreeMap<String, Vec<u8>>>,
    calls: RefCell<Vec<Call>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` succeed with `output`
    pub fn respond(mut self, pattern: &str, output: &str) -> Self {
        self.responses.push((pattern.to_string(), Ok(output.to_string())));
        self
    }

    /// Commands containing `pattern` exit non-zero
    pub fn fail(mut self, pattern: &str) -> Self {
        self.responses.push((pattern.to_string(), Err(())));
        self
    }

    /// Any copy or sync touching this remote path fails
    pub fn fail_path(mut self, remote_path: &str) -> Self {
        self.failing_paths.push(remote_path.to_string());
        self
    }

    pub fn with_file(self, path: &str, contents: &str) -> Self {
        self.remote
            .borrow_mut()
            .insert(path.to_string(), contents.as_bytes().to_vec());
        self
    }

    pub fn remote_file(&self, path: &str) -> Option<String> {
        self.remote
            .borrow()
            .get(path)
            .map(|b| String::from_utf8_lossy(b).to_string())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                Call::Run(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    fn failed(program: &'static str, what: &str) -> TransportError {
        TransportError::Exit {
            program,
            code: "1".to_string(),
            stderr: format!("scripted failure: {}", what),
        }
    }

    fn check_path(&self, program: &'static str, path: &str) -> Result<(), TransportError> {
        if self.failing_paths.iter().any(|p| p == path) {
            return Err(Self::failed(program, path));
        }
        Ok(())
    }
}

fn io_err(path: &Path, source: std::io::Error) -> TransportError {
    TransportError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl Transport for FakeTransport {
    fn run_command(&self, _target: &SshTarget, command: &str) -> Result<String, TransportError> {
        self.calls.borrow_mut().push(Call::Run(command.to_string()));

        if let Some(rest) = command.strip_prefix("mv ") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() == 2 {
                let mut remote = self.remote.borrow_mut();
                if let Some(data) = remote.remove(parts[0]) {
                    remote.insert(parts[1].to_string(), data);
                }
            }
        }

        for (pattern, response) in &self.responses {
            if command.contains(pattern.as_str()) {
                return response
                    .clone()
                    .map_err(|_| Self::failed("ssh", command));
            }
        }
        Ok(String::new())
    }

    fn copy_file_from_remote(
        &self,
        _target: &SshTarget,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), TransportError> {
        self.calls.borrow_mut().push(Call::CopyFrom(remote_path.to_string()));
        self.check_path("scp", remote_path)?;

        let data = self
            .remote
            .borrow()
            .get(remote_path)
            .cloned()
            .unwrap_or_default();
        if data.is_empty() {
            return Err(TransportError::EmptyCopy(remote_path.to_string()));
        }
        fs::write(local_path, data).map_err(|e| io_err(local_path, e))
    }

    fn copy_file_to_remote(
        &self,
        _target: &SshTarget,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), TransportError> {
        self.calls.borrow_mut().push(Call::CopyTo(remote_path.to_string()));
        self.check_path("scp", remote_path)?;

        let data = fs::read(local_path).map_err(|e| io_err(local_path, e))?;
        self.remote.borrow_mut().insert(remote_path.to_string(), data);
        Ok(())
    }

    fn sync_tree_pull(
        &self,
        _target: &SshTarget,
        remote_path: &str,
        local_path: &Path,
        _exclude: &[&str],
    ) -> Result<(), TransportError> {
        self.calls.borrow_mut().push(Call::Pull(remote_path.to_string()));
        self.check_path("rsync", remote_path)?;

        let prefix = super::with_trailing_slash(remote_path);
        fs::create_dir_all(local_path).map_err(|e| io_err(local_path, e))?;
        for (path, data) in self.remote.borrow().iter() {
            if let Some(rel) = path.strip_prefix(&prefix) {
                let dest = local_path.join(rel);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
                }
                fs::write(&dest, data).map_err(|e| io_err(&dest, e))?;
            }
        }
        Ok(())
    }

    fn sync_tree_push(
        &self,
        _target: &SshTarget,
        local_path: &Path,
        remote_path: &str,
        _exclude: &[&str],
    ) -> Result<(), TransportError> {
        self.calls.borrow_mut().push(Call::Push(remote_path.to_string()));
        self.check_path("rsync", remote_path)?;

        let prefix = super::with_trailing_slash(remote_path);
        let mut remote = self.remote.borrow_mut();
        for entry in WalkDir::new(local_path).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(local_path) {
                let data = fs::read(entry.path()).map_err(|e| io_err(entry.path(), e))?;
                remote.insert(format!("{}{}", prefix, rel.to_string_lossy()), data);
            }
        }
        Ok(())
    }
}
