use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use moat_common::Error;

pub const LOCK_FILE: &str = "proxy.lock";

/// Contents of `proxy.lock`: which process owns the singleton routing
/// proxy and where it is listening.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: i32,
    pub port: u16,
    pub started_at: DateTime<Utc>,
}

/// Outcome of the probe-and-bind election.
#[derive(Debug, PartialEq, Eq)]
pub enum Election {
    /// No live proxy; the caller should bind and then call
    /// [`ProxyLock::write`].
    Bind,
    /// A live proxy on `port` serves already; adopt it.
    Adopt(u16),
}

#[derive(Debug)]
pub struct ProxyLock {
    path: PathBuf,
}

impl ProxyLock {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(LOCK_FILE),
        }
    }

    pub fn read(&self) -> Option<LockInfo> {
        let bytes = fs::read(&self.path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Decide between adopting a live proxy and binding a new one.
    ///
    /// `requested_port == 0` means any port is acceptable. A live lock on
    /// a different explicit port is a refusal, not a takeover. Callers
    /// that go on to bind should use [`guard`](Self::guard) +
    /// [`elect_locked`](Self::elect_locked) and hold the guard until the
    /// lock is written, so two processes cannot both conclude `Bind`.
    pub fn elect(&self, requested_port: u16) -> Result<Election, Error> {
        let guard = self.guard()?;
        self.elect_locked(&guard, requested_port)
    }

    pub fn elect_locked(&self, _guard: &LockGuard, requested_port: u16) -> Result<Election, Error> {
        match self.read() {
            Some(info) if pid_alive(info.pid) => {
                if requested_port == 0 || requested_port == info.port {
                    debug!(pid = info.pid, port = info.port, "adopting running proxy");
                    Ok(Election::Adopt(info.port))
                } else {
                    Err(Error::custom(
                        moat_common::ErrorKind::PortMismatch,
                        format!(
                            "routing proxy (pid {}) is listening on port {}, not {}",
                            info.pid, info.port, requested_port
                        ),
                    ))
                }
            }
            Some(stale) => {
                debug!(pid = stale.pid, "reclaiming stale proxy lock");
                let _ = fs::remove_file(&self.path);
                Ok(Election::Bind)
            }
            None => Ok(Election::Bind),
        }
    }

    /// Record ownership after a successful bind.
    pub fn write(&self, port: u16) -> Result<(), Error> {
        let guard = self.guard()?;
        self.write_locked(&guard, port)
    }

    pub fn write_locked(&self, _guard: &LockGuard, port: u16) -> Result<(), Error> {
        let info = LockInfo {
            pid: std::process::id() as i32,
            port,
            started_at: Utc::now(),
        };
        fs::write(&self.path, serde_json::to_vec(&info)?)?;
        Ok(())
    }

    /// Remove the lock if this process owns it.
    pub fn release(&self) {
        if let Some(info) = self.read() {
            if info.pid == std::process::id() as i32 {
                let _ = fs::remove_file(&self.path);
            }
        }
    }

    /// Exclusive flock serializing the probe-and-bind sequence across
    /// processes. Released on drop.
    pub fn guard(&self) -> Result<LockGuard, Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path.with_extension("lock.guard"))?;
        file.lock_exclusive().map_err(Error::from)?;
        Ok(LockGuard { file })
    }
}

pub struct LockGuard {
    file: fs::File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Liveness probe: signal 0 checks existence without touching the process.
pub fn pid_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_dir_elects_bind() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lock = ProxyLock::new(dir.path());
        assert_eq!(lock.elect(0)?, Election::Bind);
        Ok(())
    }

    #[test]
    fn live_lock_is_adopted_on_matching_or_any_port() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lock = ProxyLock::new(dir.path());
        // Our own pid is alive by definition.
        lock.write(4100)?;

        assert_eq!(lock.elect(0)?, Election::Adopt(4100));
        assert_eq!(lock.elect(4100)?, Election::Adopt(4100));
        Ok(())
    }

    #[test]
    fn live_lock_on_other_port_is_refused() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lock = ProxyLock::new(dir.path());
        lock.write(4100)?;

        let err = lock.elect(5200).unwrap_err();
        assert_eq!(err.kind(), moat_common::ErrorKind::PortMismatch);
        Ok(())
    }

    #[test]
    fn stale_lock_is_reclaimed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lock = ProxyLock::new(dir.path());
        let stale = LockInfo {
            // Pids wrap around well below this on every supported OS.
            pid: i32::MAX - 1,
            port: 4100,
            started_at: Utc::now(),
        };
        fs::write(dir.path().join(LOCK_FILE), serde_json::to_vec(&stale)?)?;

        assert_eq!(lock.elect(0)?, Election::Bind);
        assert!(lock.read().is_none());
        Ok(())
    }

    #[test]
    fn release_only_removes_own_lock() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let lock = ProxyLock::new(dir.path());

        let other = LockInfo {
            pid: 1,
            port: 4100,
            started_at: Utc::now(),
        };
        fs::write(dir.path().join(LOCK_FILE), serde_json::to_vec(&other)?)?;
        lock.release();
        assert!(lock.read().is_some());

        lock.write(4100)?;
        lock.release();
        assert!(lock.read().is_none());
        Ok(())
    }
}
