//! Per-run work directories and their cleanup.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Work directories older than this are removed when a new run starts.
pub const STALE_WORK_DIR_AGE: Duration = Duration::from_secs(3600);

/// Prefix shared by every per-run directory.
const RUN_DIR_PREFIX: &str = "run_";

/// Layout of one harness run.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Create `<base>/run_<timestamp>_<pid>` and its subdirectories.
    pub fn create(base: &Path) -> std::io::Result<Self> {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let root = base.join(format!("{RUN_DIR_PREFIX}{stamp}_{}", std::process::id()));
        let work = Self { root };
        for dir in [
            work.root.clone(),
            work.results_dir(),
            work.worker_data_dir(),
            work.log_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        info!("Work directory: {}", work.root.display());
        Ok(work)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_dir(&self) -> PathBuf {
        self.root.join("repo")
    }

    /// Where the daemon writes run results and `state.json`.
    pub fn results_dir(&self) -> PathBuf {
        self.root.join(".home-ci")
    }

    /// Where workers drop products and markers.
    pub fn worker_data_dir(&self) -> PathBuf {
        self.root.join("worker-data")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.log_dir().join("daemon.log")
    }

    /// Remove the whole run directory.
    pub fn remove(&self) {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => info!("Removed work directory {}", self.root.display()),
            Err(e) => warn!(
                "Failed to remove work directory {}: {}",
                self.root.display(),
                e
            ),
        }
    }
}

/// Remove run directories under `base` last modified more than `max_age` ago.
/// Returns how many were removed.
pub fn cleanup_stale_work_dirs(base: &Path, max_age: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(base) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let is_run_dir = path.is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(RUN_DIR_PREFIX));
        if !is_run_dir {
            continue;
        }
        let is_stale = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > max_age);
        if is_stale && std::fs::remove_dir_all(&path).is_ok() {
            debug!("Removed stale work directory {}", path.display());
            removed += 1;
        }
    }

    if removed > 0 {
        info!("Pre-run cleanup: removed {} stale work directories", removed);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_lays_out_subdirectories() {
        let base = tempfile::tempdir().unwrap();
        let work = WorkDir::create(base.path()).unwrap();
        assert!(work.results_dir().is_dir());
        assert!(work.worker_data_dir().is_dir());
        assert!(work.log_dir().is_dir());
        assert!(!work.repo_dir().exists());
        work.remove();
        assert!(!work.root().exists());
    }

    #[test]
    fn only_old_run_directories_are_removed() {
        let base = tempfile::tempdir().unwrap();
        let run = base.path().join("run_20240101_000000_000_1");
        let other = base.path().join("keep-me");
        std::fs::create_dir_all(&run).unwrap();
        std::fs::create_dir_all(&other).unwrap();

        // Nothing is older than an hour yet.
        assert_eq!(cleanup_stale_work_dirs(base.path(), STALE_WORK_DIR_AGE), 0);
        assert!(run.exists());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cleanup_stale_work_dirs(base.path(), Duration::from_millis(1)), 1);
        assert!(!run.exists());
        assert!(other.exists());
    }

    #[test]
    fn missing_base_is_not_an_error() {
        let base = tempfile::tempdir().unwrap();
        assert_eq!(
            cleanup_stale_work_dirs(&base.path().join("absent"), STALE_WORK_DIR_AGE),
            0
        );
    }
}
