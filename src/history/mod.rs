// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Shell history mining — packages, services and accounts from bash history
//!
//! Every line is matched independently against a fixed pattern table. The
//! last capture group of a match is the item; items are deduplicated and
//! kept in lexicographic order so repeated runs produce identical output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::snapshot::{HISTORY_FILE, USERS_DIR};

/// Zero or more option tokens (`-y`, `-g`, `--now`, `--quiet`) before the item
const FLAGS: &str = r"(?:--?[a-zA-Z][a-zA-Z0-9=\-]*\s+)*";

/// Account options, where shell/home/group/comment options also take a value
const ACCOUNT_FLAGS: &str = concat!(
    r"(?:(?:-[sdgGcuk]|--(?:shell|home|home-dir|gecos|comment|gid|groups|uid|ingroup|skel))",
    r#"(?:\s+|=)(?:'[^']*'|"[^"]*"|\S+)\s+"#,
    r"|--?[a-zA-Z][a-zA-Z0-9\-]*\s+)*",
);

/// Package-manager name and its install patterns
const PACKAGE_PATTERNS: &[(&str, &[&str])] = &[
    ("apt", &[r"\bapt(?:-get)?\s+install\s+FLAGS([a-zA-Z0-9][a-zA-Z0-9.+\-]*)"]),
    ("yum", &[r"\byum\s+install\s+FLAGS([a-zA-Z0-9][a-zA-Z0-9.+\-]*)"]),
    ("dnf", &[r"\bdnf\s+install\s+FLAGS([a-zA-Z0-9][a-zA-Z0-9.+\-]*)"]),
    ("pip", &[r"\bpip3?\s+install\s+FLAGS([a-zA-Z0-9][a-zA-Z0-9.\-_]*)"]),
    ("npm", &[r"\bnpm\s+install\s+FLAGS([a-zA-Z0-9@][a-zA-Z0-9.\-@/]*)"]),
    (
        "docker",
        &[
            r"\bdocker\s+run\s+.*\s([a-zA-Z][a-zA-Z0-9.\-/]*:[a-zA-Z0-9.\-]+)",
            r"\bdocker\s+pull\s+([a-zA-Z][a-zA-Z0-9.\-/]*(?::[a-zA-Z0-9.\-]+)?)",
        ],
    ),
];

const SERVICE_PATTERNS: &[&str] = &[
    r"\bsystemctl\s+(?:start|enable|restart|status)\s+FLAGS([a-zA-Z0-9][a-zA-Z0-9.@\-]*)",
    r"\bservice\s+([a-zA-Z0-9][a-zA-Z0-9.\-]*)\s+(?:start|restart|stop|status)\b",
];

const USER_PATTERNS: &[&str] = &[
    r"\buseradd\s+ACCOUNT_FLAGS([a-zA-Z0-9_][a-zA-Z0-9_\-]*)",
    r"\badduser\s+ACCOUNT_FLAGS([a-zA-Z0-9_][a-zA-Z0-9_\-]*)",
];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| (p, p.replace("ACCOUNT_FLAGS", ACCOUNT_FLAGS).replace("FLAGS", FLAGS)))
        .filter_map(|(p, expanded)| match Regex::new(&expanded) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("Skipping invalid history pattern {}: {}", p, e);
                None
            }
        })
        .collect()
}

static PACKAGE_RULES: Lazy<Vec<(&'static str, Vec<Regex>)>> = Lazy::new(|| {
    PACKAGE_PATTERNS
        .iter()
        .map(|(manager, patterns)| (*manager, compile(patterns)))
        .collect()
});

static SERVICE_RULES: Lazy<Vec<Regex>> = Lazy::new(|| compile(SERVICE_PATTERNS));

static USER_RULES: Lazy<Vec<Regex>> = Lazy::new(|| compile(USER_PATTERNS));

// ─── Data Types ───

/// What one history file reveals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryAnalysis {
    /// Package manager → packages installed with it
    pub packages: BTreeMap<String, BTreeSet<String>>,
    pub services: BTreeSet<String>,
    pub users_created: BTreeSet<String>,
}

impl HistoryAnalysis {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty() && self.services.is_empty() && self.users_created.is_empty()
    }
}

/// Union of every user's history on one server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAnalysis {
    pub packages: BTreeMap<String, BTreeSet<String>>,
    pub services: BTreeSet<String>,
    pub users_created: BTreeSet<String>,
    pub by_user: BTreeMap<String, HistoryAnalysis>,
}

// ─── Parsing ───

/// Collect the last capture group of every pattern that matches each line
pub fn find_matches<'a, I>(lines: I, rules: &[Regex]) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut found = BTreeSet::new();
    for line in lines {
        let line = line.trim();
        for rule in rules {
            let Some(caps) = rule.captures(line) else { continue };
            let item = caps
                .iter()
                .skip(1)
                .flatten()
                .last()
                .map(|m| m.as_str().trim())
                .unwrap_or("");
            if !item.is_empty() {
                found.insert(item.to_string());
            }
        }
    }
    found
}

pub fn parse_history(raw: &str) -> HistoryAnalysis {
    let mut analysis = HistoryAnalysis::default();
    if raw.trim().is_empty() {
        return analysis;
    }

    for (manager, rules) in PACKAGE_RULES.iter() {
        let packages = find_matches(raw.lines(), rules);
        if !packages.is_empty() {
            analysis.packages.insert(manager.to_string(), packages);
        }
    }

    // `nginx.service` and `nginx` are the same unit
    analysis.services = find_matches(raw.lines(), &SERVICE_RULES)
        .into_iter()
        .map(|s| s.strip_suffix(".service").map(str::to_string).unwrap_or(s))
        .filter(|s| !s.is_empty())
        .collect();

    analysis.users_created = find_matches(raw.lines(), &USER_RULES);
    analysis
}

/// Parse a history file; a missing or unreadable file means nothing was found
pub fn parse_history_file(path: &Path) -> HistoryAnalysis {
    match fs::read(path) {
        Ok(bytes) => parse_history(&String::from_utf8_lossy(&bytes)),
        Err(e) => {
            debug!("No history at {}: {}", path.display(), e);
            HistoryAnalysis::default()
        }
    }
}

// ─── Aggregation ───

pub fn aggregate<I>(per_user: I) -> ServerAnalysis
where
    I: IntoIterator<Item = (String, HistoryAnalysis)>,
{
    let mut server = ServerAnalysis::default();
    for (user, analysis) in per_user {
        for (manager, packages) in &analysis.packages {
            server
                .packages
                .entry(manager.clone())
                .or_default()
                .extend(packages.iter().cloned());
        }
        server.services.extend(analysis.services.iter().cloned());
        server.users_created.extend(analysis.users_created.iter().cloned());
        server.by_user.insert(user, analysis);
    }
    server
}

/// Analyse `users/<name>/bash_history` under an inventory server directory
pub fn analyze_server_dir(server_dir: &Path) -> ServerAnalysis {
    let users_dir = server_dir.join(USERS_DIR);
    let Ok(entries) = fs::read_dir(&users_dir) else {
        return ServerAnalysis::default();
    };

    let per_user: Vec<(String, HistoryAnalysis)> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let history = e.path().join(HISTORY_FILE);
            history.exists().then(|| {
                (
                    e.file_name().to_string_lossy().to_string(),
                    parse_history_file(&history),
                )
            })
        })
        .inspect(|(user, analysis)| {
            if analysis.is_empty() {
                debug!("Nothing of interest in the history of {}", user);
            }
        })
        .collect();

    aggregate(per_user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_apt_install_with_yes_flag() {
        let analysis = parse_history("sudo apt-get install -y nginx\n");
        assert_eq!(analysis.packages["apt"], set(&["nginx"]));
    }

    #[test]
    fn test_useradd_with_home_flag() {
        let analysis = parse_history("useradd -m deploy\n");
        assert_eq!(analysis.users_created, set(&["deploy"]));
    }

    #[test]
    fn test_account_option_values_are_skipped() {
        let history = "\
useradd -m -s /bin/bash deploy
adduser --disabled-password --gecos '' web
useradd -c \"Build Bot\" -G sudo,docker ci
useradd --shell=/bin/zsh -d /srv/app app
";
        let analysis = parse_history(history);
        assert_eq!(analysis.users_created, set(&["app", "ci", "deploy", "web"]));
    }

    #[test]
    fn test_flags_never_reported_as_items() {
        let analysis = parse_history("apt install -y -q redis-server\napt-get install -y\n");
        assert_eq!(analysis.packages["apt"], set(&["redis-server"]));
    }

    #[test]
    fn test_all_categories() {
        let history = "\
apt-get update
apt-get install nginx
yum install -y httpd
dnf install git
pip3 install requests
npm install -g @angular/cli
docker run -d -p 80:80 --name web nginx:1.25
docker pull redis
systemctl start nginx
systemctl enable --now postgresql.service
service mysql restart
useradd -m testuser
adduser deploy
";
        let analysis = parse_history(history);

        assert_eq!(analysis.packages["apt"], set(&["nginx"]));
        assert_eq!(analysis.packages["yum"], set(&["httpd"]));
        assert_eq!(analysis.packages["dnf"], set(&["git"]));
        assert_eq!(analysis.packages["pip"], set(&["requests"]));
        assert_eq!(analysis.packages["npm"], set(&["@angular/cli"]));
        assert_eq!(analysis.packages["docker"], set(&["nginx:1.25", "redis"]));
        assert_eq!(analysis.services, set(&["mysql", "nginx", "postgresql"]));
        assert_eq!(analysis.users_created, set(&["deploy", "testuser"]));
    }

    #[test]
    fn test_duplicates_collapse_and_sort() {
        let history = "systemctl restart nginx\nsystemctl start apache2\nsystemctl status nginx\n";
        let first = parse_history(history);
        let second = parse_history(history);

        assert_eq!(first, second);
        assert_eq!(
            first.services.iter().cloned().collect::<Vec<_>>(),
            vec!["apache2".to_string(), "nginx".to_string()]
        );
    }

    #[test]
    fn test_empty_and_missing_input() {
        assert!(parse_history("").is_empty());
        assert!(parse_history("\n\n   \n").is_empty());
        assert!(parse_history("ls -la\ncd /tmp\n").is_empty());

        let dir = TempDir::new().unwrap();
        assert!(parse_history_file(&dir.path().join("nope")).is_empty());
        let empty = dir.path().join("empty");
        fs::write(&empty, "").unwrap();
        assert!(parse_history_file(&empty).is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bash_history");
        fs::write(&path, b"\xff\xfe garbage\nsystemctl start nginx\n").unwrap();
        assert_eq!(parse_history_file(&path).services, set(&["nginx"]));
    }

    #[test]
    fn test_aggregate_is_union() {
        let alice = parse_history("apt install nginx\nsystemctl start nginx\n");
        let bob = parse_history("apt install mysql-server\npip install flask\nservice mysql start\n");

        let server = aggregate(vec![
            ("alice".to_string(), alice.clone()),
            ("bob".to_string(), bob.clone()),
        ]);

        assert_eq!(server.packages["apt"], set(&["mysql-server", "nginx"]));
        assert_eq!(server.packages["pip"], set(&["flask"]));
        assert_eq!(server.services, set(&["mysql", "nginx"]));
        assert!(server.users_created.is_empty());
        assert_eq!(server.by_user["alice"], alice);
        assert_eq!(server.by_user["bob"], bob);
    }

    #[test]
    fn test_analyze_server_dir() {
        let dir = TempDir::new().unwrap();
        let root_dir = dir.path().join("users/root");
        let deploy_dir = dir.path().join("users/deploy");
        let silent_dir = dir.path().join("users/silent");
        fs::create_dir_all(&root_dir).unwrap();
        fs::create_dir_all(&deploy_dir).unwrap();
        fs::create_dir_all(&silent_dir).unwrap();
        fs::write(root_dir.join("bash_history"), "systemctl restart docker\n").unwrap();
        fs::write(deploy_dir.join("bash_history"), "sudo systemctl start nginx\n").unwrap();

        let server = analyze_server_dir(dir.path());
        assert_eq!(server.services, set(&["docker", "nginx"]));
        assert_eq!(server.by_user.len(), 2);
        assert!(!server.by_user.contains_key("silent"));

        assert_eq!(analyze_server_dir(&dir.path().join("missing")), ServerAnalysis::default());
    }
}
