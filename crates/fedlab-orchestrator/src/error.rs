//! Orchestrator error types.

use fedlab_state::{ExperimentId, ExperimentStatus};
use thiserror::Error;

/// Errors surfaced by the orchestration operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("experiment not found: {0}")]
    NotFound(ExperimentId),

    #[error("checkpoint {checkpoint_id} not found for experiment {experiment_id}")]
    CheckpointNotFound {
        experiment_id: ExperimentId,
        checkpoint_id: i64,
    },

    /// The invalid-state case for a start on a `running` experiment.
    #[error("experiment {0} is already running")]
    AlreadyRunning(ExperimentId),

    #[error("experiment {id} is {status}, cannot start")]
    InvalidState {
        id: ExperimentId,
        status: ExperimentStatus,
    },

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("path escapes store root: {0}")]
    PathEscape(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record store error: {0}")]
    Store(#[from] fedlab_state::StateError),

    #[error(transparent)]
    Config(#[from] fedlab_core::ConfigError),
}

impl OrchestratorError {
    /// True for rejections caused by the experiment's current status.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::AlreadyRunning(_) | Self::InvalidState { .. })
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
