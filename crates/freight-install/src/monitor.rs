//! The installation change counter and its rate-limited file monitor.

use crate::InstallError;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const CHANGED_FILE: &str = ".changed";
const RATE_LIMIT: Duration = Duration::from_millis(100);

/// Read the monotonically increasing change counter.
pub fn read_counter(root: &Path) -> u64 {
    std::fs::read_to_string(root.join(CHANGED_FILE))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Bump the change counter. Called after every mutation of the installation.
pub fn bump_counter(root: &Path) -> Result<u64, InstallError> {
    let next = read_counter(root) + 1;
    let path = root.join(CHANGED_FILE);
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, next.to_string()).map_err(|e| InstallError::io_at(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| InstallError::io_at(&path, e))?;
    Ok(next)
}

/// Polling monitor over the change counter.
///
/// Bursts of mutations within the 100 ms rate limit coalesce into a single
/// observed change; every change is eventually observed.
#[derive(Debug)]
pub struct FileMonitor {
    root: PathBuf,
    last_seen: u64,
    last_poll: Option<Instant>,
}

impl FileMonitor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let last_seen = read_counter(&root);
        Self {
            root,
            last_seen,
            last_poll: None,
        }
    }

    /// Whether the installation changed since the last observed poll.
    ///
    /// Returns `false` without touching the disk when called again within
    /// the rate limit.
    pub fn poll(&mut self) -> bool {
        if let Some(last) = self.last_poll {
            if last.elapsed() < RATE_LIMIT {
                return false;
            }
        }
        self.last_poll = Some(Instant::now());
        let current = read_counter(&self.root);
        if current != self.last_seen {
            self.last_seen = current;
            true
        } else {
            false
        }
    }

    /// Forget rate-limit state, forcing the next poll to hit the disk.
    pub fn reset(&mut self) {
        self.last_poll = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_starts_at_zero_and_increments() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_counter(dir.path()), 0);
        assert_eq!(bump_counter(dir.path()).unwrap(), 1);
        assert_eq!(bump_counter(dir.path()).unwrap(), 2);
        assert_eq!(read_counter(dir.path()), 2);
    }

    #[test]
    fn monitor_sees_change_after_rate_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = FileMonitor::new(dir.path());
        assert!(!monitor.poll());
        bump_counter(dir.path()).unwrap();
        monitor.reset();
        assert!(monitor.poll());
        // No further change: next (reset) poll is quiet.
        monitor.reset();
        assert!(!monitor.poll());
    }

    #[test]
    fn monitor_rate_limits_polls() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = FileMonitor::new(dir.path());
        let _ = monitor.poll();
        bump_counter(dir.path()).unwrap();
        // Within the rate limit the change is not yet observed.
        assert!(!monitor.poll());
    }

    #[test]
    fn burst_coalesces_into_one_observation() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = FileMonitor::new(dir.path());
        let _ = monitor.poll();
        for _ in 0..5 {
            bump_counter(dir.path()).unwrap();
        }
        monitor.reset();
        assert!(monitor.poll());
        monitor.reset();
        assert!(!monitor.poll());
    }
}
