//! Filesystem roots owned by the orchestrator and path containment.
//!
//! Stored paths (checkpoint `file_path`, upload references) are always
//! relative to a configured root. Every lookup goes through
//! [`resolve_within`], which refuses anything that would land outside it.

use std::path::{Component, Path, PathBuf};

use fedlab_core::PathsConfig;
use fedlab_state::{checkpoint_dir_name, ExperimentId};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Checkpoint store root and uploads root.
#[derive(Debug, Clone)]
pub struct ArtifactRoots {
    checkpoints: PathBuf,
    uploads: PathBuf,
}

impl ArtifactRoots {
    pub fn new(checkpoints: impl Into<PathBuf>, uploads: impl Into<PathBuf>) -> Self {
        Self {
            checkpoints: checkpoints.into(),
            uploads: uploads.into(),
        }
    }

    pub fn from_config(paths: &PathsConfig) -> Self {
        Self::new(&paths.checkpoints, &paths.uploads)
    }

    pub fn checkpoints_root(&self) -> &Path {
        &self.checkpoints
    }

    pub fn uploads_root(&self) -> &Path {
        &self.uploads
    }

    /// The directory the worker writes an experiment's checkpoints into.
    pub fn checkpoint_dir(&self, id: ExperimentId) -> PathBuf {
        self.checkpoints.join(checkpoint_dir_name(id))
    }

    /// Resolve a checkpoint row's `file_path` under the checkpoint root.
    pub fn resolve_checkpoint(&self, file_path: &str) -> OrchestratorResult<PathBuf> {
        resolve_within(&self.checkpoints, file_path)
    }

    /// Resolve an upload reference under the uploads root.
    pub fn resolve_upload(&self, reference: &str) -> OrchestratorResult<PathBuf> {
        resolve_within(&self.uploads, reference)
    }
}

/// Join `relative` onto `root`, rejecting anything that escapes it.
///
/// Absolute paths and `..` components are refused outright. If the target
/// exists it is canonicalized as well, so a symlink pointing out of the root
/// is refused too.
pub fn resolve_within(root: &Path, relative: &str) -> OrchestratorResult<PathBuf> {
    let escape = || OrchestratorError::PathEscape(relative.to_string());

    if relative.trim().is_empty() {
        return Err(escape());
    }
    let rel = Path::new(relative);
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(escape());
            }
        }
    }

    let joined = root.join(rel);
    if let (Ok(real_root), Ok(real_target)) = (root.canonicalize(), joined.canonicalize()) {
        if !real_target.starts_with(&real_root) {
            return Err(escape());
        }
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_dir_is_per_experiment() {
        let roots = ArtifactRoots::new("/data/checkpoints", "/data/uploads");
        assert_eq!(roots.checkpoint_dir(7), PathBuf::from("/data/checkpoints/exp_7"));
    }

    #[test]
    fn accepts_plain_relative_paths() {
        let root = Path::new("/data/checkpoints");
        assert_eq!(
            resolve_within(root, "exp_1/round_3.pt").unwrap(),
            PathBuf::from("/data/checkpoints/exp_1/round_3.pt")
        );
        assert!(resolve_within(root, "./exp_1/round_3.pt").is_ok());
    }

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        let root = Path::new("/data/checkpoints");
        for bad in [
            "../secrets.txt",
            "exp_1/../../etc/passwd",
            "/etc/passwd",
            "",
            "   ",
        ] {
            let err = resolve_within(root, bad).unwrap_err();
            assert!(matches!(err, OrchestratorError::PathEscape(_)), "{bad:?} accepted");
        }
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_out_of_root() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"nope").unwrap();

        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("exp_1")).unwrap();

        let err = resolve_within(root.path(), "exp_1/secret.txt").unwrap_err();
        assert!(matches!(err, OrchestratorError::PathEscape(_)));
    }

    #[test]
    fn existing_file_inside_root_resolves() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("exp_2")).unwrap();
        std::fs::write(root.path().join("exp_2/round_1.pt"), b"weights").unwrap();

        let roots = ArtifactRoots::new(root.path(), root.path().join("uploads"));
        let path = roots.resolve_checkpoint("exp_2/round_1.pt").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"weights");
    }
}
