//! Mutually-exclusive reindex coordination via an `O_CREAT|O_EXCL` lock
//! file, grounded exactly in the reference lock protocol: a poll-based
//! timeout rather than a blocking OS-level file lock, so timeouts are
//! observable and bounded regardless of platform.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::DocRagError;

pub struct ReindexCoordinator {
    lock_path: PathBuf,
}

pub struct ReindexGuard<'a> {
    coordinator: &'a ReindexCoordinator,
}

impl Drop for ReindexGuard<'_> {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.coordinator.lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, path = %self.coordinator.lock_path.display(), "failed to remove reindex lock file"),
        }
    }
}

impl ReindexCoordinator {
    pub fn new(lock_path: PathBuf) -> Self {
        Self { lock_path }
    }

    pub fn is_reindexing(&self) -> bool {
        self.lock_path.exists()
    }

    fn held_by_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.lock_path).ok()?.trim().parse().ok()
    }

    /// Acquire the lock, polling every `poll_ms` until `timeout` elapses.
    /// The returned guard releases the lock (ignoring a concurrent removal)
    /// when dropped — including on panic-unwind paths.
    pub fn acquire(&self, timeout: Duration, poll: Duration) -> Result<ReindexGuard<'_>, DocRagError> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let start = Instant::now();
        loop {
            match OpenOptions::new().create_new(true).write(true).open(&self.lock_path) {
                Ok(mut f) => {
                    let _ = write!(f, "{}", std::process::id());
                    return Ok(ReindexGuard { coordinator: self });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if start.elapsed() >= timeout {
                        return Err(DocRagError::ReindexLocked { pid: self.held_by_pid() });
                    }
                    std::thread::sleep(poll);
                }
                Err(e) => return Err(DocRagError::Index(format!("failed to create reindex lock: {e}"))),
            }
        }
    }
}

pub fn default_lock_path(data_dir: &Path) -> PathBuf {
    data_dir.join("locks").join("reindexing.lock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_then_release_allows_reacquire() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("reindexing.lock");
        let coordinator = ReindexCoordinator::new(lock_path.clone());

        {
            let _guard = coordinator.acquire(Duration::from_millis(500), Duration::from_millis(50)).unwrap();
            assert!(coordinator.is_reindexing());
        }
        assert!(!coordinator.is_reindexing());
        let _guard2 = coordinator.acquire(Duration::from_millis(500), Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn concurrent_acquire_times_out() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("reindexing.lock");
        let coordinator = ReindexCoordinator::new(lock_path);

        let _held = coordinator.acquire(Duration::from_millis(500), Duration::from_millis(50)).unwrap();
        let second = coordinator.acquire(Duration::from_millis(150), Duration::from_millis(20));
        assert!(matches!(second, Err(DocRagError::ReindexLocked { .. })));
    }
}
