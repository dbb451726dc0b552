//! Lifecycle controller — the only writer of `pending → running`.
//!
//! `start` commits the status change first and only then launches the
//! worker. If the launch fails the experiment is moved to `failed` so it is
//! never left `running` with nothing behind it. Terminal writes after a
//! successful launch belong to the worker.

use std::sync::Arc;

use chrono::Utc;
use fedlab_state::*;
use tracing::{error, info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::supervisor::Launcher;

/// Result of a successful `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub experiment_id: ExperimentId,
    pub pid: Option<u32>,
}

pub struct LifecycleController {
    store: StateStore,
    launcher: Arc<dyn Launcher>,
}

impl LifecycleController {
    pub fn new(store: StateStore, launcher: Arc<dyn Launcher>) -> Self {
        Self { store, launcher }
    }

    /// Mark the experiment running, then hand it to the launcher.
    pub fn start(&self, experiment_id: ExperimentId) -> OrchestratorResult<StartOutcome> {
        match self.store.begin_run(experiment_id, Utc::now())? {
            Transition::Applied => {}
            Transition::Missing => return Err(OrchestratorError::NotFound(experiment_id)),
            Transition::Rejected(ExperimentStatus::Running) => {
                return Err(OrchestratorError::AlreadyRunning(experiment_id));
            }
            Transition::Rejected(status) => {
                return Err(OrchestratorError::InvalidState {
                    id: experiment_id,
                    status,
                });
            }
        }
        info!(experiment_id, "experiment marked running");

        match self.launcher.launch(experiment_id) {
            Ok(worker) => Ok(StartOutcome {
                experiment_id,
                pid: worker.pid,
            }),
            Err(err) => {
                error!(experiment_id, error = %err, "worker launch failed");
                self.roll_back(experiment_id, &err);
                Err(err)
            }
        }
    }

    /// Move a run whose worker never started to `failed`.
    fn roll_back(&self, experiment_id: ExperimentId, cause: &OrchestratorError) {
        let outcome = RunOutcome::Failed {
            error: format!("worker launch failed: {cause}"),
        };
        match self.store.finish_run(experiment_id, &outcome, Utc::now()) {
            Ok(Transition::Applied) => {
                warn!(experiment_id, "experiment rolled back to failed");
            }
            Ok(other) => {
                warn!(experiment_id, transition = ?other, "rollback found experiment no longer running");
            }
            Err(e) => {
                error!(experiment_id, error = %e, "failed to roll back experiment after launch failure");
            }
        }
    }
}
