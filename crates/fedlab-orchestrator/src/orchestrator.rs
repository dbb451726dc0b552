//! The orchestration facade the HTTP layer talks to.

use std::path::PathBuf;
use std::sync::Arc;

use fedlab_core::FedlabConfig;
use fedlab_state::{Checkpoint, ExperimentId, StateStore};
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::artifacts::ArtifactRoots;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::feed::{ProgressFeed, UpdateEvent};
use crate::lifecycle::{LifecycleController, StartOutcome};
use crate::supervisor::{Launcher, ProcessSupervisor};
use crate::teardown::{TeardownCoordinator, TeardownReport};

/// A checkpoint row together with the file it points to.
#[derive(Debug, Clone)]
pub struct CheckpointFile {
    pub checkpoint: Checkpoint,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Lifecycle, feed and teardown over one record store.
pub struct Orchestrator {
    store: StateStore,
    roots: ArtifactRoots,
    lifecycle: LifecycleController,
    feed: ProgressFeed,
    teardown: TeardownCoordinator,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        roots: ArtifactRoots,
        launcher: Arc<dyn Launcher>,
        feed: ProgressFeed,
    ) -> Self {
        Self {
            lifecycle: LifecycleController::new(store.clone(), launcher),
            teardown: TeardownCoordinator::new(store.clone(), roots.clone()),
            store,
            roots,
            feed,
        }
    }

    /// Wire up the process supervisor and feed from `fedlab.toml`.
    pub fn from_config(
        config: &FedlabConfig,
        store: StateStore,
        shutdown: watch::Receiver<bool>,
    ) -> OrchestratorResult<Self> {
        let roots = ArtifactRoots::from_config(&config.paths);
        let supervisor = ProcessSupervisor::new(
            config.worker.clone(),
            roots.clone(),
            config.store.path.clone(),
        );
        let feed = ProgressFeed::new(store.clone(), config.feed.poll_interval()?)
            .with_shutdown(shutdown);
        Ok(Self::new(store, roots, Arc::new(supervisor), feed))
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn roots(&self) -> &ArtifactRoots {
        &self.roots
    }

    pub fn start(&self, experiment_id: ExperimentId) -> OrchestratorResult<StartOutcome> {
        self.lifecycle.start(experiment_id)
    }

    pub fn subscribe(&self, experiment_id: ExperimentId) -> ReceiverStream<UpdateEvent> {
        self.feed.subscribe(experiment_id)
    }

    pub async fn delete(&self, experiment_id: ExperimentId) -> OrchestratorResult<TeardownReport> {
        self.teardown.delete(experiment_id).await
    }

    /// Resolve a checkpoint row to a path under the checkpoint root.
    pub fn checkpoint_path(
        &self,
        experiment_id: ExperimentId,
        checkpoint_id: i64,
    ) -> OrchestratorResult<(Checkpoint, PathBuf)> {
        if self.store.get_experiment(experiment_id)?.is_none() {
            return Err(OrchestratorError::NotFound(experiment_id));
        }
        let checkpoint = self
            .store
            .get_checkpoint(experiment_id, checkpoint_id)?
            .ok_or(OrchestratorError::CheckpointNotFound {
                experiment_id,
                checkpoint_id,
            })?;
        let path = self.roots.resolve_checkpoint(&checkpoint.file_path)?;
        Ok((checkpoint, path))
    }

    /// Read a checkpoint's bytes. A row whose file is missing is not found.
    pub async fn read_checkpoint(
        &self,
        experiment_id: ExperimentId,
        checkpoint_id: i64,
    ) -> OrchestratorResult<CheckpointFile> {
        let (checkpoint, path) = self.checkpoint_path(experiment_id, checkpoint_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OrchestratorError::CheckpointNotFound {
                    experiment_id,
                    checkpoint_id,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("checkpoint_{checkpoint_id}"));
        debug!(experiment_id, checkpoint_id, size = bytes.len(), "checkpoint read");
        Ok(CheckpointFile {
            checkpoint,
            file_name,
            bytes,
        })
    }
}
