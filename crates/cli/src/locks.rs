//! Lock file management for daemon exclusivity

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "mailwatch.lock";

/// Exclusive lock held for the daemon's lifetime
///
/// Two daemons syncing the same mail store would race each other's sync
/// commands, so `run` refuses to start while another daemon holds this.
pub struct DaemonLock {
    path: PathBuf,
    #[allow(dead_code)]
    file: File,
}

/// Lock file content
#[derive(Debug, Serialize, Deserialize)]
struct LockContent {
    pid: u32,
    started_at: DateTime<Utc>,
}

impl DaemonLock {
    /// Directory holding the lock file: the runtime dir, else the state dir
    pub fn default_dir() -> Result<PathBuf> {
        dirs::runtime_dir()
            .or_else(dirs::state_dir)
            .or_else(dirs::cache_dir)
            .map(|dir| dir.join("mailwatch"))
            .context("Could not determine a runtime directory for the daemon lock")
    }

    /// Acquire the exclusive daemon lock in `dir`
    ///
    /// Returns error if:
    /// - Lock is already held by a running daemon
    /// - Permission denied
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create lock directory {}", dir.display()))?;
        let lock_path = dir.join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;

        if !try_flock_exclusive(&file)? {
            return match Self::read_lock_content(&mut file) {
                Ok(content) => Err(anyhow::anyhow!(
                    "mailwatch is already running (pid {}, started {})",
                    content.pid,
                    content.started_at.to_rfc3339()
                )),
                Err(_) => Err(anyhow::anyhow!(
                    "mailwatch is already running (lock file {} is held)",
                    lock_path.display()
                )),
            };
        }

        // The flock is ours, so any previous holder is gone
        if let Ok(content) = Self::read_lock_content(&mut file) {
            if content.pid != std::process::id() && !is_process_alive(content.pid) {
                tracing::warn!(pid = content.pid, "Removing stale daemon lock");
            }
        }

        Self::write_lock_content(&mut file)?;

        Ok(Self {
            path: lock_path,
            file,
        })
    }

    /// Whether a running daemon holds the lock in `dir`
    ///
    /// Only tries the flock; the lock file is neither created nor changed.
    pub fn is_held(dir: &Path) -> bool {
        match File::open(dir.join(LOCK_FILE)) {
            Ok(file) => matches!(try_flock_exclusive(&file), Ok(false)),
            Err(_) => false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the daemon lock
    pub fn release(self) -> Result<()> {
        std::fs::remove_file(&self.path).context("Failed to remove lock file")?;
        Ok(())
    }

    /// Write lock content (PID + start time)
    fn write_lock_content(file: &mut File) -> Result<()> {
        let content = LockContent {
            pid: std::process::id(),
            started_at: Utc::now(),
        };

        let serialized = serde_json::to_string(&content).context("Failed to serialize lock content")?;

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(serialized.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn read_lock_content(file: &mut File) -> Result<LockContent> {
        file.seek(SeekFrom::Start(0))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let content: LockContent =
            serde_json::from_str(&contents).context("Failed to deserialize lock content")?;
        Ok(content)
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Try to acquire exclusive file lock (non-blocking)
fn try_flock_exclusive(file: &File) -> Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Null signal: existence check only
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lock_acquisition() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();

        let lock1 = DaemonLock::acquire(dir);
        assert!(lock1.is_ok());

        // Same process, but the flock is held by another open file
        let lock2 = DaemonLock::acquire(dir);
        let err = lock2.err().unwrap().to_string();
        assert!(err.contains("already running"), "{}", err);
        assert!(err.contains(&std::process::id().to_string()), "{}", err);

        drop(lock1);

        let lock3 = DaemonLock::acquire(dir);
        assert!(lock3.is_ok());
    }

    #[test]
    fn test_is_held() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        assert!(!DaemonLock::is_held(dir));

        let lock = DaemonLock::acquire(dir).unwrap();
        assert!(DaemonLock::is_held(dir));
        assert!(DaemonLock::is_held(dir), "checking must not take the lock");

        drop(lock);
        assert!(!DaemonLock::is_held(dir));

        // Left behind by a crashed daemon: the file exists but nobody holds it
        fs::write(dir.join(LOCK_FILE), r#"{"pid":999999,"started_at":"2024-01-01T00:00:00Z"}"#).unwrap();
        assert!(!DaemonLock::is_held(dir));
    }

    #[test]
    fn test_lock_release() {
        let temp_dir = TempDir::new().unwrap();

        let lock = DaemonLock::acquire(temp_dir.path()).unwrap();
        let lock_path = lock.path().to_path_buf();
        assert!(lock_path.exists());

        lock.release().unwrap();
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join(LOCK_FILE);
        fs::write(&lock_path, r#"{"pid":999999,"started_at":"2024-01-01T00:00:00Z"}"#).unwrap();

        let lock = DaemonLock::acquire(temp_dir.path()).unwrap();
        let contents = fs::read_to_string(lock.path()).unwrap();
        let content: LockContent = serde_json::from_str(&contents).unwrap();
        assert_eq!(content.pid, std::process::id());
    }

    #[test]
    fn test_garbage_lock_file_is_overwritten() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(LOCK_FILE), "not json at all").unwrap();

        assert!(DaemonLock::acquire(temp_dir.path()).is_ok());
    }

    #[test]
    fn test_lock_content() {
        let temp_dir = TempDir::new().unwrap();
        let lock_file = temp_dir.path().join("test.lock");

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_file)
            .unwrap();

        DaemonLock::write_lock_content(&mut file).unwrap();
        let content = DaemonLock::read_lock_content(&mut file).unwrap();

        assert_eq!(content.pid, std::process::id());
        assert!(content.started_at <= Utc::now());
    }

    #[test]
    fn test_process_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(999999));
    }
}
