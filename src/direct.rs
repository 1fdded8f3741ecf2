//! Direct management of the resolver file.
//!
//! Used only when no other mechanism provably owns the resolver. The file
//! written by this module starts with a marker comment carrying the writing
//! process's PID, enabling safe ownership checks and orphan cleanup. A file
//! found in place before the first write is moved aside and restored on
//! [`down`](DnsApplier::down).

use crate::config::DnsConfig;
use crate::dns::DnsApplier;
use crate::error::Result;
use crate::util::is_process_alive;
use std::path::{Path, PathBuf};

/// Marker comment embedded in every managed resolver file.
const MANAGED_BY_MARKER: &str = "# resolv.conf(5) file generated by tun-netcfg";

/// Suffix of the backup kept next to the resolver file.
const BACKUP_SUFFIX: &str = ".pre-tun-netcfg";

/// Writes the resolver file wholesale.
///
/// # Lifecycle
///
/// 1. [`up`](DnsApplier::up) moves a foreign resolver file to
///    `<file>.pre-tun-netcfg` and writes ours in its place.
/// 2. Further `up` calls overwrite our file; the backup is kept.
/// 3. [`down`](DnsApplier::down) restores the backup, or removes our file if
///    there was nothing to back up.
///
/// # Crash recovery
///
/// If the process exits without calling `down`, our file persists. On next
/// startup, call [`cleanup_orphaned`](Self::cleanup_orphaned) to revert it
/// when its writer is no longer running.
///
/// # Example
///
/// ```rust,ignore
/// use tun_netcfg::{DirectApplier, DnsApplier, DnsConfig};
///
/// let direct = DirectApplier::new("/etc/resolv.conf");
/// direct.up(&DnsConfig::new(["100.100.100.100".parse()?]))?;
/// // ...
/// direct.down()?;
/// ```
#[derive(Debug, Clone)]
pub struct DirectApplier {
    path: PathBuf,
    backup: PathBuf,
}

impl DirectApplier {
    /// Creates an applier for the resolver file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut backup = path.clone().into_os_string();
        backup.push(BACKUP_SUFFIX);
        Self {
            path,
            backup: PathBuf::from(backup),
        }
    }

    /// Returns the resolver file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path the original resolver file is moved to.
    #[must_use]
    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    /// Returns `true` if the resolver file currently on disk is ours.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        is_managed(&self.path)
    }

    /// Reverts a resolver file left behind by a process that is no longer
    /// running.
    ///
    /// Returns `true` if something was reverted. Foreign files and files
    /// belonging to a live process are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Io`](crate::NetError::Io) if the revert fails.
    pub fn cleanup_orphaned(&self) -> Result<bool> {
        let Some(pid) = extract_pid(&self.path) else {
            return Ok(false);
        };
        if is_process_alive(pid) {
            return Ok(false);
        }
        tracing::info!(
            pid = pid,
            path = %self.path.display(),
            "Reverting orphaned resolver file (process dead)"
        );
        self.down()?;
        Ok(true)
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tun-netcfg.tmp");
        PathBuf::from(tmp)
    }
}

impl DnsApplier for DirectApplier {
    fn up(&self, config: &DnsConfig) -> Result<()> {
        // Stage first: a failed write must leave the current file in place.
        let tmp = self.temp_path();
        std::fs::write(&tmp, generate_file_content(config))?;

        let backed_up = exists(&self.path) && !is_managed(&self.path);
        if backed_up {
            if let Err(e) = std::fs::rename(&self.path, &self.backup) {
                let _ = std::fs::remove_file(&tmp);
                return Err(e.into());
            }
            tracing::info!(
                path = %self.path.display(),
                backup = %self.backup.display(),
                "Backed up resolver file"
            );
        }

        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            if backed_up {
                if let Err(restore) = std::fs::rename(&self.backup, &self.path) {
                    tracing::warn!(
                        backup = %self.backup.display(),
                        error = %restore,
                        "Failed to put resolver file back after a failed write"
                    );
                }
            }
            return Err(e.into());
        }

        tracing::info!(
            nameservers = ?config.nameservers,
            domains = ?config.domains,
            path = %self.path.display(),
            "Wrote resolver file"
        );
        Ok(())
    }

    fn down(&self) -> Result<()> {
        let ours = is_managed(&self.path);

        if exists(&self.path) && !ours {
            if exists(&self.backup) {
                tracing::warn!(
                    path = %self.path.display(),
                    backup = %self.backup.display(),
                    "Resolver file replaced by another tool, refusing to restore backup"
                );
            } else {
                tracing::debug!(path = %self.path.display(), "Resolver file not ours, skipping");
            }
            return Ok(());
        }

        if exists(&self.backup) {
            std::fs::rename(&self.backup, &self.path)?;
            tracing::info!(path = %self.path.display(), "Restored resolver file from backup");
        } else if ours {
            std::fs::remove_file(&self.path)?;
            tracing::info!(path = %self.path.display(), "Removed resolver file");
        } else {
            tracing::debug!(path = %self.path.display(), "Nothing to revert");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File content helpers
// ---------------------------------------------------------------------------

/// Generates resolver file content.
///
/// ```text
/// # resolv.conf(5) file generated by tun-netcfg (pid=12345)
/// # DO NOT EDIT THIS FILE BY HAND -- CHANGES WILL BE OVERWRITTEN
///
/// nameserver 100.100.100.100
/// search corp.example
/// ```
fn generate_file_content(config: &DnsConfig) -> String {
    let pid = std::process::id();
    format!(
        "{MANAGED_BY_MARKER} (pid={pid})\n# DO NOT EDIT THIS FILE BY HAND -- CHANGES WILL BE OVERWRITTEN\n\n{body}",
        body = config.to_resolv_conf(),
    )
}

/// Present, including dangling symlinks such as a stale stub-resolv.conf link.
fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

/// Checks whether a file contains the ownership marker.
fn is_managed(path: &Path) -> bool {
    std::fs::read_to_string(path).is_ok_and(|c| c.contains(MANAGED_BY_MARKER))
}

/// Extracts the PID from the ownership marker.
fn extract_pid(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix(MANAGED_BY_MARKER) {
            let rest = rest.trim().strip_prefix("(pid=")?;
            return rest.strip_suffix(')')?.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use tracing_test::traced_test;

    fn sample() -> DnsConfig {
        DnsConfig::new(["100.100.100.100".parse::<IpAddr>().unwrap()])
            .with_domains(["corp.example"])
    }

    #[test]
    fn generate_content_includes_marker_and_pid() {
        let content = generate_file_content(&sample());

        assert!(content.contains(MANAGED_BY_MARKER));
        assert!(content.contains("nameserver 100.100.100.100"));
        assert!(content.contains("search corp.example"));
        assert!(content.contains(&format!("pid={}", std::process::id())));
        assert!(!content.contains("resolvconf"));
    }

    #[test]
    fn up_backs_up_and_down_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 192.168.1.1\n").unwrap();
        let direct = DirectApplier::new(&path);

        direct.up(&sample()).unwrap();
        assert!(direct.is_applied());
        assert_eq!(
            std::fs::read_to_string(direct.backup_path()).unwrap(),
            "nameserver 192.168.1.1\n"
        );
        assert_eq!(DnsConfig::parse(&std::fs::read_to_string(&path).unwrap()), sample());

        direct.down().unwrap();
        assert!(!direct.is_applied());
        assert!(!direct.backup_path().exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "nameserver 192.168.1.1\n");
    }

    #[test]
    fn repeated_up_keeps_original_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 192.168.1.1\n").unwrap();
        let direct = DirectApplier::new(&path);

        direct.up(&sample()).unwrap();
        direct.up(&DnsConfig::new(["10.0.0.53".parse::<IpAddr>().unwrap()])).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("nameserver 10.0.0.53"));
        assert!(!content.contains("100.100.100.100"));
        assert_eq!(
            std::fs::read_to_string(direct.backup_path()).unwrap(),
            "nameserver 192.168.1.1\n"
        );
    }

    #[test]
    fn failed_write_keeps_original_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 192.168.1.1\n").unwrap();
        let r = DirectApplier::new(&path);
        // A directory where the staged file goes makes the write fail.
        std::fs::create_dir(r.temp_path()).unwrap();

        assert!(r.up(&sample()).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "nameserver 192.168.1.1\n");
        assert!(!r.backup_path().exists());
    }

    #[test]
    fn down_without_original_removes_our_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        let direct = DirectApplier::new(&path);

        direct.up(&sample()).unwrap();
        assert!(path.exists());
        direct.down().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn down_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 192.168.1.1\n").unwrap();
        let direct = DirectApplier::new(&path);

        direct.up(&sample()).unwrap();
        direct.down().unwrap();
        direct.down().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "nameserver 192.168.1.1\n");
    }

    #[test]
    fn down_never_applied_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        DirectApplier::new(dir.path().join("resolv.conf")).down().unwrap();
    }

    #[traced_test]
    #[test]
    fn down_refuses_to_clobber_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 192.168.1.1\n").unwrap();
        let direct = DirectApplier::new(&path);

        direct.up(&sample()).unwrap();
        std::fs::write(&path, "# Generated by NetworkManager\nnameserver 10.1.1.1\n").unwrap();

        direct.down().unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("10.1.1.1"));
        assert!(direct.backup_path().exists());
        assert!(logs_contain("refusing to restore backup"));
    }

    #[test]
    fn extract_pid_parses_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(
            &path,
            format!("{MANAGED_BY_MARKER} (pid=42)\nnameserver 100.100.100.100\n"),
        )
        .unwrap();
        assert_eq!(extract_pid(&path), Some(42));
    }

    #[test]
    fn cleanup_reverts_dead_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        let direct = DirectApplier::new(&path);
        std::fs::write(direct.backup_path(), "nameserver 192.168.1.1\n").unwrap();
        std::fs::write(
            &path,
            format!("{MANAGED_BY_MARKER} (pid=999999999)\nnameserver 100.100.100.100\n"),
        )
        .unwrap();

        assert!(direct.cleanup_orphaned().unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "nameserver 192.168.1.1\n");
    }

    #[test]
    fn cleanup_preserves_alive_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        let direct = DirectApplier::new(&path);
        direct.up(&sample()).unwrap();

        assert!(!direct.cleanup_orphaned().unwrap());
        assert!(direct.is_applied());
    }

    #[test]
    fn cleanup_ignores_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 192.168.1.1\n").unwrap();

        assert!(!DirectApplier::new(&path).cleanup_orphaned().unwrap());
        assert!(path.exists());
    }
}
