//! Filesystem layout: the service's own job working directories and the
//! shared area exchanged with the front end. Mirrors the path-resolution
//! style of the teacher's `jobstore.rs` (one small struct per directory
//! concept, one method per path it owns).

use std::path::{Path, PathBuf};

use crate::model::JobId;

/// The service's own root, `dirname(realpath(current_exe))/..` in the
/// original; here it is simply the current working directory the daemon is
/// launched from, which is how `spec.md` describes `<service_root>` (no
/// resolution priority chain is specified, unlike the teacher's job-root
/// flag/env/XDG chain, because `spec.md` names no equivalent override).
pub fn service_root() -> anyhow::Result<PathBuf> {
    std::env::current_dir().map_err(Into::into)
}

/// `<service_root>/jobs/job_<id>/`, owned by the worker for its lifetime.
#[derive(Clone)]
pub struct JobDir {
    root: PathBuf,
}

impl JobDir {
    pub fn new(service_root: &Path, id: JobId) -> Self {
        JobDir {
            root: service_root.join("jobs").join(format!("job_{id}")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn inputs(&self) -> PathBuf {
        self.root.join("inputs")
    }

    pub fn outputs(&self) -> PathBuf {
        self.root.join("outputs")
    }

    pub fn kill_token(&self) -> PathBuf {
        self.root.join("kill.it")
    }

    pub fn debug_log(&self, id: JobId) -> PathBuf {
        self.root.join(format!("{id}.log"))
    }

    pub fn error_marker(&self, id: JobId) -> PathBuf {
        self.root.join(format!("{id}.err"))
    }

    /// Deletes and recreates the working directory with empty `inputs/` and
    /// `outputs/` subdirectories, per `spec.md` §3: "owned by the worker
    /// for its lifetime and deleted and recreated on start."
    pub fn recreate(&self) -> anyhow::Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        std::fs::create_dir_all(self.inputs())?;
        std::fs::create_dir_all(self.outputs())?;
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    pub fn kill_token_present(&self) -> bool {
        self.kill_token().is_file()
    }

    pub fn remove(&self) -> anyhow::Result<()> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}

/// The signal channel's FIFO path, `<service_root>/jobs/signals/job_<id>.fifo`.
///
/// Deliberately kept *outside* the per-job working directory: the worker
/// recreates that directory wholesale on start (`JobDir::recreate`), which
/// would otherwise delete the FIFO out from under the supervisor's already
/// non-blocking-opened read end. The signal channel is infrastructure the
/// registry owns (`spec.md` §4.4), not worker-owned job state.
pub fn signal_fifo_path(service_root: &Path, id: JobId) -> PathBuf {
    service_root.join("jobs").join("signals").join(format!("job_{id}.fifo"))
}

/// `<shared>/Models/` and `<shared>/Results/<id>/`.
#[derive(Clone)]
pub struct SharedArea {
    root: PathBuf,
}

impl SharedArea {
    pub fn new(shared_dir: impl Into<PathBuf>) -> Self {
        let mut root: PathBuf = shared_dir.into();
        // Trailing slash is stripped the same way `main.py` strips a
        // trailing "/" from the shared-dir CLI argument.
        if root.as_os_str().to_string_lossy().ends_with('/') {
            root = PathBuf::from(root.to_string_lossy().trim_end_matches('/').to_string());
        }
        SharedArea { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_archive(&self, archive: &str) -> PathBuf {
        self.root.join("Models").join(archive)
    }

    pub fn results_dir(&self, id: JobId) -> PathBuf {
        self.root.join("Results").join(id.to_string())
    }

    /// Deletes and recreates `Results/<id>/`, per `spec.md` §3: "The service
    /// recreates the results directory from scratch on each successful or
    /// failed publication."
    pub fn recreate_results(&self, id: JobId) -> anyhow::Result<PathBuf> {
        let dir = self.results_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_dir_paths() {
        let jd = JobDir::new(Path::new("/srv/caliserv"), JobId(42));
        assert_eq!(jd.path(), Path::new("/srv/caliserv/jobs/job_42"));
        assert_eq!(jd.kill_token(), Path::new("/srv/caliserv/jobs/job_42/kill.it"));
        assert_eq!(
            signal_fifo_path(Path::new("/srv/caliserv"), JobId(42)),
            Path::new("/srv/caliserv/jobs/signals/job_42.fifo")
        );
    }

    #[test]
    fn shared_area_strips_trailing_slash() {
        let s = SharedArea::new("/mnt/share/");
        assert_eq!(s.root(), Path::new("/mnt/share"));
        assert_eq!(
            s.model_archive("houseA.zip"),
            Path::new("/mnt/share/Models/houseA.zip")
        );
        assert_eq!(
            s.results_dir(JobId(7)),
            Path::new("/mnt/share/Results/7")
        );
    }

    #[test]
    fn recreate_makes_fresh_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let jd = JobDir::new(tmp.path(), JobId(1));
        jd.recreate().unwrap();
        assert!(jd.inputs().is_dir());
        assert!(jd.outputs().is_dir());
        std::fs::write(jd.inputs().join("marker"), b"x").unwrap();
        jd.recreate().unwrap();
        assert!(!jd.inputs().join("marker").exists());
    }
}
