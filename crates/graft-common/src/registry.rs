//! Process registry: one JSON file per spawned command.
//!
//! Every migration, verification, and user command is recorded under the
//! per-user cache directory at spawn and removed on exit. Readers prune
//! entries whose PIDs are no longer alive, so a crashed engine never
//! leaves phantom processes in listings.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// A registered subprocess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    /// Repository (working directory) the command ran in.
    pub repo: String,
    /// Role: "migration", "verify", "user", or "git".
    pub role: String,
    /// RFC-3339 UTC spawn time.
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

/// Directory holding one `<pid>.json` per live process.
///
/// `GRAFT_CACHE_DIR` overrides the default `~/.cache/graft`.
#[must_use]
pub fn registry_dir() -> PathBuf {
    let root = std::env::var("GRAFT_CACHE_DIR").map_or_else(
        |_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".cache/graft")
        },
        PathBuf::from,
    );
    root.join("processes")
}

fn record_path(pid: u32) -> PathBuf {
    registry_dir().join(format!("{pid}.json"))
}

/// Record a spawned process. Each process writes its own file, so
/// concurrent writers never contend.
pub fn register(record: &ProcessRecord) -> std::io::Result<()> {
    let dir = registry_dir();
    fs::create_dir_all(&dir)?;
    let content = serde_json::to_string_pretty(record)?;
    fs::write(record_path(record.pid), content)
}

/// Remove a process record on exit. Missing files are not an error.
pub fn deregister(pid: u32) {
    let path = record_path(pid);
    if let Err(e) = fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("failed to deregister process {pid}: {e}");
        }
    }
}

/// Whether a PID refers to a live process.
///
/// `kill(pid, 0)` probes without signalling; EPERM means the process
/// exists but belongs to another user.
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        #[allow(clippy::cast_possible_wrap)]
        let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if ret == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// List registered processes, pruning records whose PIDs are dead.
#[must_use]
pub fn list() -> Vec<ProcessRecord> {
    let dir = registry_dir();
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };

    let mut records = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }

        let record: Option<ProcessRecord> = fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok());

        match record {
            Some(record) if pid_alive(record.pid) => records.push(record),
            // Dead PID or unreadable record: prune the stale file.
            _ => {
                let _ = fs::remove_file(&path);
            }
        }
    }

    records.sort_by_key(|r| r.pid);
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serialize registry tests: they share the GRAFT_CACHE_DIR env var.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn record(pid: u32) -> ProcessRecord {
        ProcessRecord {
            pid,
            repo: "/tmp/repo".to_string(),
            role: "migration".to_string(),
            started_at: "2026-01-31T10:30:00Z".to_string(),
            log_path: None,
        }
    }

    #[test]
    fn register_list_deregister_cycle() {
        let _guard = ENV_LOCK.lock().unwrap();
        let temp = tempfile::tempdir().unwrap();
        std::env::set_var("GRAFT_CACHE_DIR", temp.path());

        // Our own PID is certainly alive.
        let own_pid = std::process::id();
        register(&record(own_pid)).unwrap();

        let records = list();
        assert!(records.iter().any(|r| r.pid == own_pid));

        deregister(own_pid);
        let records = list();
        assert!(!records.iter().any(|r| r.pid == own_pid));

        std::env::remove_var("GRAFT_CACHE_DIR");
    }

    #[test]
    fn list_prunes_dead_pids() {
        let _guard = ENV_LOCK.lock().unwrap();
        let temp = tempfile::tempdir().unwrap();
        std::env::set_var("GRAFT_CACHE_DIR", temp.path());

        // A child that has already been reaped leaves a dead PID behind.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        register(&record(dead_pid)).unwrap();
        assert!(record_path(dead_pid).exists());

        let records = list();
        assert!(!records.iter().any(|r| r.pid == dead_pid));
        assert!(!record_path(dead_pid).exists(), "stale record not pruned");

        std::env::remove_var("GRAFT_CACHE_DIR");
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }
}
