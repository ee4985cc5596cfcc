// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Snapshot tree layout — naming, discovery and sidecar files
//!
//! A run root is `ibr-<YYYYMMDD-HHMMSS>` and holds one `<ip>-<YYYYMMDD>`
//! directory per server. Later runs find earlier ones by these names, so the
//! formats here are fixed.

use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error};
use walkdir::WalkDir;

pub const RUN_PREFIX: &str = "ibr";
const RUN_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const SERVER_DATE_FORMAT: &str = "%Y%m%d";
pub const DISPLAY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const SERVER_INFO_FILE: &str = "server_info.txt";
pub const SUDO_USERS_FILE: &str = "sudo_users.txt";
pub const ANALYSIS_FILE: &str = "server_analysis.json";
pub const SUMMARY_JSON_FILE: &str = "backup_summary.json";
pub const SUMMARY_TEXT_FILE: &str = "backup_summary.txt";
pub const RESTORE_LOG_FILE: &str = "restore_log.txt";
pub const HISTORY_FILE: &str = "bash_history";

pub const USERS_DIR: &str = "users";
pub const SERVICES_DIR: &str = "services";
pub const HOMES_DIR: &str = "homes";
pub const SYSTEM_DIR: &str = "system";
pub const FILES_DIR: &str = "files";

/// A run could not lay out its directory tree
#[derive(Debug, Error)]
pub enum RunError {
    #[error("cannot create {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: io::Error,
    },
}

// ─── Naming ───

pub fn run_dir_name(at: NaiveDateTime) -> String {
    format!("{}-{}", RUN_PREFIX, at.format(RUN_TIMESTAMP_FORMAT))
}

pub fn server_dir_name(ip: &str, on: NaiveDate) -> String {
    format!("{}-{}", ip, on.format(SERVER_DATE_FORMAT))
}

pub fn parse_run_dir_name(name: &str) -> Option<NaiveDateTime> {
    let stamp = name.strip_prefix(RUN_PREFIX)?.strip_prefix('-')?;
    NaiveDateTime::parse_from_str(stamp, RUN_TIMESTAMP_FORMAT).ok()
}

/// Split `<ip>-<YYYYMMDD>` at the last dash
pub fn parse_server_dir_name(name: &str) -> Option<(String, NaiveDate)> {
    let (ip, date) = name.rsplit_once('-')?;
    if ip.is_empty() {
        return None;
    }
    let date = NaiveDate::parse_from_str(date, SERVER_DATE_FORMAT).ok()?;
    Some((ip.to_string(), date))
}

/// Create the run root: the explicit directory, or a fresh timestamped one under `base`
pub fn create_run_root(base: &Path, explicit: Option<&Path>) -> io::Result<PathBuf> {
    let root = match explicit {
        Some(dir) => dir.to_path_buf(),
        None => base.join(run_dir_name(Local::now().naive_local())),
    };
    fs::create_dir_all(&root)?;
    Ok(root)
}

pub fn create_server_dir(run_root: &Path, ip: &str) -> io::Result<PathBuf> {
    let dir = run_root.join(server_dir_name(ip, Local::now().date_naive()));
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

// ─── Discovery ───

fn child_dirs(dir: &Path) -> Vec<(String, PathBuf)> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().is_dir())
                .map(|e| (e.file_name().to_string_lossy().to_string(), e.path()))
                .collect()
        })
        .unwrap_or_default()
}

/// Server directories of a run root, oldest date first
pub fn find_server_dirs(run_root: &Path) -> Vec<(String, NaiveDate, PathBuf)> {
    let mut found: Vec<_> = child_dirs(run_root)
        .into_iter()
        .filter_map(|(name, path)| {
            parse_server_dir_name(&name).map(|(ip, date)| (ip, date, path))
        })
        .collect();
    found.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    found
}

/// Newest inventory server directory for `ip` under `base`.
///
/// Only server directories holding a `users/` tree count; backup runs share
/// the same naming but carry no histories.
pub fn find_latest_inventory(base: &Path, ip: &str) -> Option<PathBuf> {
    let mut runs: Vec<(NaiveDateTime, PathBuf)> = child_dirs(base)
        .into_iter()
        .filter_map(|(name, path)| parse_run_dir_name(&name).map(|at| (at, path)))
        .collect();
    runs.sort_by(|a, b| b.0.cmp(&a.0));

    for (at, run) in runs {
        let newest = find_server_dirs(&run)
            .into_iter()
            .filter(|(server_ip, _, path)| server_ip == ip && path.join(USERS_DIR).is_dir())
            .max_by_key(|(_, date, _)| *date);
        if let Some((_, _, path)) = newest {
            debug!("Inventory for {} found in run {}", ip, at);
            return Some(path);
        }
    }
    None
}

/// Names of the immediate subdirectories, sorted
pub fn list_subdirs(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = child_dirs(dir).into_iter().map(|(name, _)| name).collect();
    names.sort();
    names
}

// ─── Persistence ───

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Failed to serialize {}: {}", path.display(), e))?;
    fs::write(path, json).map_err(|e| format!("Failed to write {}: {}", path.display(), e))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let data = fs::read_to_string(path).ok()?;
    serde_json::from_str(&data)
        .map_err(|e| error!("Failed to parse {}: {}", path.display(), e))
        .ok()
}

/// Write `server_info.txt`: who the directory belongs to and when it was taken
pub fn write_server_info(
    server_dir: &Path,
    ip: &str,
    description: &str,
    date_label: &str,
) -> Result<(), String> {
    let body = format!(
        "IP: {}\nDescription: {}\n{}: {}\n",
        ip,
        description,
        date_label,
        Local::now().format(DISPLAY_TIME_FORMAT)
    );
    let path = server_dir.join(SERVER_INFO_FILE);
    fs::write(&path, body).map_err(|e| format!("Failed to write {}: {}", path.display(), e))
}

/// Total bytes of regular files below `path`
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn make_inventory(base: &Path, run: &str, server: &str) -> PathBuf {
        let dir = base.join(run).join(server);
        fs::create_dir_all(dir.join(USERS_DIR)).unwrap();
        dir
    }

    #[test]
    fn test_names_roundtrip_through_parsers() {
        let at = date(2024, 1, 1).and_hms_opt(12, 0, 0).unwrap();
        assert_eq!(run_dir_name(at), "ibr-20240101-120000");
        assert_eq!(parse_run_dir_name("ibr-20240101-120000"), Some(at));
        assert_eq!(server_dir_name("203.0.113.5", date(2024, 1, 1)), "203.0.113.5-20240101");
        assert_eq!(
            parse_server_dir_name("203.0.113.5-20240101"),
            Some(("203.0.113.5".to_string(), date(2024, 1, 1)))
        );
    }

    #[test]
    fn test_unparseable_names_rejected() {
        assert_eq!(parse_run_dir_name("ibr-latest"), None);
        assert_eq!(parse_run_dir_name("backup-20240101-120000"), None);
        assert_eq!(parse_server_dir_name("203.0.113.5"), None);
        assert_eq!(parse_server_dir_name("-20240101"), None);
        assert_eq!(parse_server_dir_name("notes-draft"), None);
    }

    #[test]
    fn test_latest_inventory_uses_parsed_timestamps() {
        let base = TempDir::new().unwrap();
        make_inventory(base.path(), "ibr-20231231-235959", "203.0.113.5-20231231");
        let newest = make_inventory(base.path(), "ibr-20240102-080000", "203.0.113.5-20240102");
        make_inventory(base.path(), "ibr-20240101-120000", "203.0.113.5-20240101");
        // Backup run: newer but no histories
        fs::create_dir_all(base.path().join("ibr-20240103-000000/203.0.113.5-20240103/homes")).unwrap();
        // Not a run root at all
        make_inventory(base.path(), "ibr-zzz", "203.0.113.5-20991231");

        assert_eq!(find_latest_inventory(base.path(), "203.0.113.5"), Some(newest));
        assert_eq!(find_latest_inventory(base.path(), "198.51.100.7"), None);
        assert_eq!(find_latest_inventory(&base.path().join("nope"), "203.0.113.5"), None);
    }

    #[test]
    fn test_find_server_dirs_ignores_other_entries() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("203.0.113.5-20240101")).unwrap();
        fs::create_dir_all(root.path().join("198.51.100.7-20240101")).unwrap();
        fs::create_dir_all(root.path().join("scratch")).unwrap();
        fs::write(root.path().join("10.0.0.1-20240101"), "a file").unwrap();

        let ips: Vec<String> = find_server_dirs(root.path()).into_iter().map(|s| s.0).collect();
        assert_eq!(ips, vec!["198.51.100.7", "203.0.113.5"]);
    }

    #[test]
    fn test_dir_size_and_format() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("a/b")).unwrap();
        fs::write(root.path().join("a/one"), vec![0u8; 1000]).unwrap();
        fs::write(root.path().join("a/b/two"), vec![0u8; 24]).unwrap();

        assert_eq!(dir_size(root.path()), 1024);
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512.00 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1536 * 1024), "1.50 MB");
    }

    #[test]
    fn test_json_sidecar_roundtrip() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("nested/list.json");
        write_json(&path, &vec!["nginx", "mysql"]).unwrap();
        let back: Vec<String> = read_json(&path).unwrap();
        assert_eq!(back, vec!["nginx", "mysql"]);
        assert!(read_json::<Vec<String>>(&root.path().join("missing.json")).is_none());
    }
}
