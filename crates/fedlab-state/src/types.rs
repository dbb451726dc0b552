//! Domain types for the fedlab record store.
//!
//! These mirror the rows of the `experiments`, `metrics` and
//! `model_checkpoints` tables. All types are serializable to/from JSON so
//! the API layer can return them unchanged.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// Integer identity of an experiment row.
pub type ExperimentId = i64;

// ── Experiment ─────────────────────────────────────────────────────

/// Lifecycle status of an experiment.
///
/// Only ever advances `pending → running → {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position along the lifecycle; terminal states share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StateError::Invalid(format!("unknown experiment status {other:?}"))),
        }
    }
}

/// One submitted training job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    pub description: Option<String>,
    /// Free-text compute framework tag ("pytorch", "tensorflow", ...).
    pub framework: String,
    pub status: ExperimentStatus,
    pub artifacts: ArtifactRefs,
    pub training: TrainingParams,
    pub resources: ResourceHints,
    /// Opaque extension config handed to the worker untouched.
    pub config_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_accuracy: Option<f64>,
    pub final_loss: Option<f64>,
    /// Set by the worker (or a failed launch) on the failure transition only.
    pub error_message: Option<String>,
    pub logs: String,
}

/// References returned by the artifact store, relative to the uploads root.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArtifactRefs {
    pub algorithm_path: Option<String>,
    pub model_path: Option<String>,
    pub config_path: Option<String>,
    pub dataset_path: Option<String>,
}

impl ArtifactRefs {
    /// All references that are set, in a stable order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        [
            &self.algorithm_path,
            &self.model_path,
            &self.config_path,
            &self.dataset_path,
        ]
        .into_iter()
        .filter_map(|p| p.as_deref())
    }
}

/// Numeric training parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingParams {
    pub num_clients: u32,
    pub num_rounds: u32,
    #[serde(default = "default_client_fraction")]
    pub client_fraction: f64,
    #[serde(default = "default_local_epochs")]
    pub local_epochs: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
}

/// Resource hints passed through to the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceHints {
    pub use_gpu: bool,
    pub cpus_per_client: f64,
    pub gpu_fraction_per_client: f64,
}

impl Default for ResourceHints {
    fn default() -> Self {
        Self {
            use_gpu: false,
            cpus_per_client: 1.0,
            gpu_fraction_per_client: 0.0,
        }
    }
}

fn default_client_fraction() -> f64 {
    1.0
}

fn default_local_epochs() -> u32 {
    1
}

fn default_learning_rate() -> f64 {
    0.01
}

fn default_framework() -> String {
    "pytorch".to_string()
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// Creation request for an experiment. The row starts out `pending`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewExperiment {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_framework")]
    pub framework: String,
    #[serde(default)]
    pub artifacts: ArtifactRefs,
    pub training: TrainingParams,
    #[serde(default)]
    pub resources: ResourceHints,
    #[serde(default = "empty_object")]
    pub config_json: serde_json::Value,
}

impl NewExperiment {
    /// Check field ranges before the row is written.
    pub fn validate(&self) -> Result<(), StateError> {
        let t = &self.training;
        let r = &self.resources;
        let problem = if self.name.trim().is_empty() {
            Some("name must not be empty".to_string())
        } else if t.num_clients == 0 {
            Some("num_clients must be positive".to_string())
        } else if t.num_rounds == 0 {
            Some("num_rounds must be positive".to_string())
        } else if !(t.client_fraction > 0.0 && t.client_fraction <= 1.0) {
            Some(format!("client_fraction must be in (0, 1], got {}", t.client_fraction))
        } else if t.local_epochs == 0 {
            Some("local_epochs must be positive".to_string())
        } else if !(t.learning_rate > 0.0) {
            Some(format!("learning_rate must be positive, got {}", t.learning_rate))
        } else if !(r.cpus_per_client >= 0.0) {
            Some("cpus_per_client must not be negative".to_string())
        } else if !(0.0..=1.0).contains(&r.gpu_fraction_per_client) {
            Some(format!(
                "gpu_fraction_per_client must be in [0, 1], got {}",
                r.gpu_fraction_per_client
            ))
        } else {
            None
        };
        match problem {
            Some(msg) => Err(StateError::Invalid(msg)),
            None => Ok(()),
        }
    }
}

/// How a run ended. Written once, on the `running → terminal` transition.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        final_accuracy: Option<f64>,
        final_loss: Option<f64>,
    },
    /// `error` is normally the worker's own message. The one exception is a
    /// worker that never started: the orchestrator then records
    /// `worker launch failed: <cause>` itself.
    Failed {
        error: String,
    },
}

impl RunOutcome {
    pub fn status(&self) -> ExperimentStatus {
        match self {
            Self::Completed { .. } => ExperimentStatus::Completed,
            Self::Failed { .. } => ExperimentStatus::Failed,
        }
    }
}

/// Result of a conditional status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The row was in the expected state and has been updated.
    Applied,
    /// No experiment with that ID.
    Missing,
    /// The row exists but was not in the expected state.
    Rejected(ExperimentStatus),
}

// ── Metric ─────────────────────────────────────────────────────────

/// Per-round metrics reported by the worker. Any field may be missing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    pub id: i64,
    pub experiment_id: ExperimentId,
    pub round: u32,
    pub train_loss: Option<f64>,
    pub train_accuracy: Option<f64>,
    pub eval_loss: Option<f64>,
    pub eval_accuracy: Option<f64>,
    pub client_metrics: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMetric {
    pub experiment_id: ExperimentId,
    pub round: u32,
    #[serde(default)]
    pub train_loss: Option<f64>,
    #[serde(default)]
    pub train_accuracy: Option<f64>,
    #[serde(default)]
    pub eval_loss: Option<f64>,
    #[serde(default)]
    pub eval_accuracy: Option<f64>,
    #[serde(default)]
    pub client_metrics: serde_json::Value,
}

impl NewMetric {
    /// A metric row for `round` with no values filled in.
    pub fn for_round(experiment_id: ExperimentId, round: u32) -> Self {
        Self {
            experiment_id,
            round,
            train_loss: None,
            train_accuracy: None,
            eval_loss: None,
            eval_accuracy: None,
            client_metrics: serde_json::Value::Array(Vec::new()),
        }
    }
}

// ── Checkpoint ─────────────────────────────────────────────────────

/// A saved model artifact for one round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub id: i64,
    pub experiment_id: ExperimentId,
    pub round: u32,
    /// Path relative to the checkpoint store root.
    pub file_path: String,
    pub accuracy: Option<f64>,
    pub loss: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewCheckpoint {
    pub experiment_id: ExperimentId,
    pub round: u32,
    pub file_path: String,
    #[serde(default)]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub loss: Option<f64>,
}

/// Directory name of an experiment below the checkpoint store root.
pub fn checkpoint_dir_name(id: ExperimentId) -> String {
    format!("exp_{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> NewExperiment {
        NewExperiment {
            name: "mnist-fedavg".to_string(),
            description: None,
            framework: "pytorch".to_string(),
            artifacts: ArtifactRefs::default(),
            training: TrainingParams {
                num_clients: 10,
                num_rounds: 3,
                client_fraction: 0.5,
                local_epochs: 1,
                learning_rate: 0.01,
            },
            resources: ResourceHints::default(),
            config_json: serde_json::json!({}),
        }
    }

    #[test]
    fn status_parse_and_display() {
        for s in ["pending", "running", "completed", "failed"] {
            let status: ExperimentStatus = s.parse().unwrap();
            assert_eq!(status.to_string(), s);
        }
        assert!("paused".parse::<ExperimentStatus>().is_err());
    }

    #[test]
    fn status_rank_is_monotonic_along_lifecycle() {
        assert!(ExperimentStatus::Pending.rank() < ExperimentStatus::Running.rank());
        assert!(ExperimentStatus::Running.rank() < ExperimentStatus::Completed.rank());
        assert_eq!(ExperimentStatus::Completed.rank(), ExperimentStatus::Failed.rank());
        assert!(!ExperimentStatus::Running.is_terminal());
        assert!(ExperimentStatus::Failed.is_terminal());
    }

    #[test]
    fn validate_accepts_reasonable_request() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_out_of_range_fields() {
        let mut req = valid();
        req.training.num_rounds = 0;
        assert!(req.validate().is_err());

        let mut req = valid();
        req.training.num_clients = 0;
        assert!(req.validate().is_err());

        let mut req = valid();
        req.training.client_fraction = 1.5;
        assert!(req.validate().is_err());

        let mut req = valid();
        req.training.learning_rate = f64::NAN;
        assert!(req.validate().is_err());

        let mut req = valid();
        req.resources.gpu_fraction_per_client = 2.0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn new_experiment_body_fills_defaults() {
        let req: NewExperiment = serde_json::from_value(serde_json::json!({
            "name": "cifar",
            "training": { "num_clients": 4, "num_rounds": 5 }
        }))
        .unwrap();
        assert_eq!(req.framework, "pytorch");
        assert_eq!(req.training.client_fraction, 1.0);
        assert_eq!(req.resources.cpus_per_client, 1.0);
        assert_eq!(req.config_json, serde_json::json!({}));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn artifact_paths_skips_unset() {
        let refs = ArtifactRefs {
            algorithm_path: Some("algo.py".to_string()),
            model_path: None,
            config_path: Some("cfg.py".to_string()),
            dataset_path: None,
        };
        assert_eq!(refs.paths().collect::<Vec<_>>(), vec!["algo.py", "cfg.py"]);
    }
}
