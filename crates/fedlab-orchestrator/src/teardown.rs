//! Teardown coordinator — deletes an experiment and its files.
//!
//! Filesystem cleanup runs before the row delete. If the delete fails the
//! whole operation can simply be retried: files that are already gone are
//! skipped. Individual file errors are logged and never abort the teardown.

use std::io::ErrorKind;
use std::path::Path;

use fedlab_state::{ExperimentId, ExperimentStatus, StateStore};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactRoots;
use crate::error::{OrchestratorError, OrchestratorResult};

/// What a teardown actually removed from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub files_removed: usize,
    pub checkpoint_dir_removed: bool,
}

pub struct TeardownCoordinator {
    store: StateStore,
    roots: ArtifactRoots,
}

impl TeardownCoordinator {
    pub fn new(store: StateStore, roots: ArtifactRoots) -> Self {
        Self { store, roots }
    }

    pub async fn delete(&self, experiment_id: ExperimentId) -> OrchestratorResult<TeardownReport> {
        let experiment = self
            .store
            .get_experiment(experiment_id)?
            .ok_or(OrchestratorError::NotFound(experiment_id))?;

        if experiment.status == ExperimentStatus::Running {
            // The worker keeps running; its later writes will miss the row.
            warn!(experiment_id, "deleting an experiment that is still running");
        }

        let mut report = TeardownReport::default();

        for reference in experiment.artifacts.paths() {
            let path = match self.roots.resolve_upload(reference) {
                Ok(path) => path,
                Err(e) => {
                    warn!(experiment_id, %reference, error = %e, "skipping upload outside uploads root");
                    continue;
                }
            };
            if remove_file(&path).await {
                report.files_removed += 1;
            }
        }

        let checkpoint_dir = self.roots.checkpoint_dir(experiment_id);
        report.checkpoint_dir_removed = remove_dir(&checkpoint_dir).await;

        if !self.store.delete_experiment(experiment_id)? {
            // Lost a race with another delete; the end state is the same.
            debug!(experiment_id, "experiment row already gone");
        }

        info!(
            experiment_id,
            files_removed = report.files_removed,
            checkpoint_dir_removed = report.checkpoint_dir_removed,
            "experiment deleted"
        );
        Ok(report)
    }
}

/// Best-effort file removal. True only if a file was actually deleted.
async fn remove_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "upload removed");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove upload");
            false
        }
    }
}

/// Best-effort recursive removal. True only if the directory existed and is gone.
async fn remove_dir(path: &Path) -> bool {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "checkpoint directory removed");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove checkpoint directory");
            false
        }
    }
}
