// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Service recipes — what to save for a service and how to put it back
//!
//! Recipes are plain data. Supporting another service means adding a table
//! entry, not code.

use std::collections::BTreeMap;

/// Paths, introspection commands and generated dump files for one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecipe {
    pub paths: &'static [&'static str],
    pub commands: &'static [&'static str],
    /// Remote scratch files produced by `commands`; fetched then deleted
    pub files: &'static [&'static str],
}

/// A file from the service backup and where it goes on the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePlacement {
    /// Relative to the service backup directory
    pub source: &'static str,
    pub destination: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRecipe {
    pub paths: &'static [&'static str],
    pub pre_restore_command: Option<&'static str>,
    pub post_restore_command: Option<&'static str>,
    /// Used only when there is no post-restore command
    pub restart_command: Option<&'static str>,
    pub files: &'static [FilePlacement],
    /// Binary whose presence means the service is installed
    pub binary: &'static str,
    pub apt_package: &'static str,
    pub yum_package: &'static str,
}

const BACKUP_RECIPES: &[(&str, BackupRecipe)] = &[
    (
        "nginx",
        BackupRecipe {
            paths: &["/etc/nginx/", "/var/www/"],
            commands: &["nginx -T"],
            files: &[],
        },
    ),
    (
        "apache2",
        BackupRecipe {
            paths: &["/etc/apache2/", "/var/www/"],
            commands: &["apache2ctl -S"],
            files: &[],
        },
    ),
    (
        "mysql",
        BackupRecipe {
            paths: &["/etc/mysql/"],
            commands: &["mysqldump --all-databases > /tmp/all_databases.sql"],
            files: &["/tmp/all_databases.sql"],
        },
    ),
    (
        "postgresql",
        BackupRecipe {
            paths: &["/etc/postgresql/"],
            commands: &["pg_dumpall -U postgres > /tmp/pg_dumpall.sql"],
            files: &["/tmp/pg_dumpall.sql"],
        },
    ),
    (
        "docker",
        BackupRecipe {
            paths: &["/var/lib/docker/volumes/", "/etc/docker/"],
            commands: &["docker ps", "docker volume ls"],
            files: &[],
        },
    ),
    (
        "nodejs",
        BackupRecipe {
            paths: &["/etc/nodejs/", "/var/www/"],
            commands: &[],
            files: &[],
        },
    ),
];

const RESTORE_RECIPES: &[(&str, RestoreRecipe)] = &[
    (
        "nginx",
        RestoreRecipe {
            paths: &["/etc/nginx/", "/var/www/"],
            pre_restore_command: None,
            post_restore_command: None,
            restart_command: Some("systemctl restart nginx"),
            files: &[],
            binary: "nginx",
            apt_package: "nginx",
            yum_package: "nginx",
        },
    ),
    (
        "apache2",
        RestoreRecipe {
            paths: &["/etc/apache2/", "/var/www/"],
            pre_restore_command: None,
            post_restore_command: None,
            restart_command: Some("systemctl restart apache2"),
            files: &[],
            binary: "apache2",
            apt_package: "apache2",
            yum_package: "httpd",
        },
    ),
    (
        "mysql",
        RestoreRecipe {
            paths: &["/etc/mysql/"],
            pre_restore_command: Some("systemctl stop mysql"),
            post_restore_command: Some("systemctl start mysql && mysql < /tmp/all_databases.sql"),
            restart_command: None,
            files: &[FilePlacement {
                source: "files/all_databases.sql",
                destination: "/tmp/all_databases.sql",
            }],
            binary: "mysql",
            apt_package: "mysql-server",
            yum_package: "mysql-server",
        },
    ),
    (
        "postgresql",
        RestoreRecipe {
            paths: &["/etc/postgresql/"],
            pre_restore_command: Some("systemctl stop postgresql"),
            post_restore_command: Some(
                "systemctl start postgresql && su - postgres -c 'psql -f /tmp/pg_dumpall.sql'",
            ),
            restart_command: None,
            files: &[FilePlacement {
                source: "files/pg_dumpall.sql",
                destination: "/tmp/pg_dumpall.sql",
            }],
            binary: "psql",
            apt_package: "postgresql",
            yum_package: "postgresql-server",
        },
    ),
    (
        "docker",
        RestoreRecipe {
            paths: &["/etc/docker/"],
            pre_restore_command: None,
            post_restore_command: Some("systemctl restart docker"),
            restart_command: None,
            files: &[],
            binary: "docker",
            apt_package: "docker.io",
            yum_package: "docker",
        },
    ),
    (
        "nodejs",
        RestoreRecipe {
            paths: &["/etc/nodejs/", "/var/www/"],
            pre_restore_command: None,
            post_restore_command: None,
            restart_command: None,
            files: &[],
            binary: "node",
            apt_package: "nodejs",
            yum_package: "nodejs",
        },
    ),
];

/// Read-only recipe tables, built once and handed to the orchestrators
#[derive(Debug, Clone)]
pub struct RecipeBook {
    backup: BTreeMap<&'static str, &'static BackupRecipe>,
    restore: BTreeMap<&'static str, &'static RestoreRecipe>,
}

impl RecipeBook {
    pub fn builtin() -> Self {
        Self {
            backup: BACKUP_RECIPES.iter().map(|(name, r)| (*name, r)).collect(),
            restore: RESTORE_RECIPES.iter().map(|(name, r)| (*name, r)).collect(),
        }
    }

    pub fn backup(&self, service: &str) -> Option<&'static BackupRecipe> {
        self.backup.get(service).copied()
    }

    pub fn restore(&self, service: &str) -> Option<&'static RestoreRecipe> {
        self.restore.get(service).copied()
    }

    pub fn backup_services(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.backup.keys().copied()
    }
}

impl Default for RecipeBook {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let book = RecipeBook::builtin();
        assert_eq!(book.backup("nginx").unwrap().paths, &["/etc/nginx/", "/var/www/"]);
        assert_eq!(
            book.restore("nginx").unwrap().restart_command,
            Some("systemctl restart nginx")
        );
        assert!(book.backup("unknown").is_none());
        assert!(book.restore("unknown").is_none());
        assert_eq!(book.restore("nodejs").unwrap().binary, "node");
    }

    #[test]
    fn test_every_backup_recipe_can_be_restored() {
        // Without a restore recipe the top-level fallback would mirror whole /etc or /var
        let book = RecipeBook::builtin();
        for service in book.backup_services() {
            assert!(book.restore(service).is_some(), "{} has no restore recipe", service);
        }
    }

    #[test]
    fn test_dump_files_line_up_between_backup_and_restore() {
        let book = RecipeBook::builtin();
        for service in book.backup_services() {
            let backup = book.backup(service).unwrap();
            for remote in backup.files {
                let name = remote.rsplit('/').next().unwrap();
                let restore = book.restore(service).expect("dump without restore recipe");
                assert!(
                    restore.files.iter().any(|f| f.source == format!("files/{}", name)),
                    "{} dump {} has no placement",
                    service,
                    name
                );
            }
        }
    }

    #[test]
    fn test_recipe_paths_are_absolute_dirs() {
        let book = RecipeBook::builtin();
        for service in book.backup_services() {
            for path in book.backup(service).unwrap().paths {
                assert!(path.starts_with('/') && path.ends_with('/'), "{}", path);
            }
            if let Some(restore) = book.restore(service) {
                for path in restore.paths {
                    assert!(path.starts_with('/') && path.ends_with('/'), "{}", path);
                }
            }
        }
    }
}
