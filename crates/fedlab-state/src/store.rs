//! StateStore — SQLite-backed record store for fedlab.
//!
//! Provides typed access to experiments, metrics, and checkpoints. Status
//! changes go through conditional updates (`begin_run`, `finish_run`) so that
//! the lifecycle can never move backwards, even with the worker process
//! writing to the same database concurrently.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::schema::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// How long a writer waits on a lock held by the other process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Thread-safe record store handle.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let conn = Connection::open(path).map_err(map_err!(Open))?;
        // WAL lets the worker write while the daemon reads.
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(map_err!(Open))?;
        let store = Self::from_connection(conn)?;
        debug!(?path, journal_mode = %mode, "record store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let conn = Connection::open_in_memory().map_err(map_err!(Open))?;
        let store = Self::from_connection(conn)?;
        debug!("in-memory record store opened");
        Ok(store)
    }

    fn from_connection(conn: Connection) -> StateResult<Self> {
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(map_err!(Open))?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_err!(Open))?;
        conn.execute_batch(CREATE_TABLES).map_err(map_err!(Schema))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> StateResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::Lock)
    }

    // ── Experiments ────────────────────────────────────────────────

    /// Insert a new experiment in `pending` state.
    pub fn insert_experiment(&self, req: &NewExperiment) -> StateResult<Experiment> {
        req.validate()?;
        let config_json = serde_json::to_string(&req.config_json).map_err(map_err!(Serialize))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO experiments (
                name, description, framework, status,
                algorithm_path, model_path, config_path, dataset_path,
                num_clients, num_rounds, client_fraction, local_epochs, learning_rate,
                use_gpu, cpus_per_client, gpu_fraction_per_client, config_json, created_at
            ) VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                req.name,
                req.description,
                req.framework,
                req.artifacts.algorithm_path,
                req.artifacts.model_path,
                req.artifacts.config_path,
                req.artifacts.dataset_path,
                req.training.num_clients,
                req.training.num_rounds,
                req.training.client_fraction,
                req.training.local_epochs,
                req.training.learning_rate,
                req.resources.use_gpu,
                req.resources.cpus_per_client,
                req.resources.gpu_fraction_per_client,
                config_json,
                format_ts(Utc::now()),
            ],
        )
        .map_err(map_err!(Write))?;
        let id = conn.last_insert_rowid();
        let experiment = fetch_experiment(&conn, id)?
            .ok_or_else(|| StateError::Read(format!("experiment {id} vanished after insert")))?;
        debug!(experiment_id = id, name = %experiment.name, "experiment stored");
        Ok(experiment)
    }

    /// Get an experiment by ID.
    pub fn get_experiment(&self, id: ExperimentId) -> StateResult<Option<Experiment>> {
        let conn = self.conn()?;
        fetch_experiment(&conn, id)
    }

    /// List all experiments, newest first.
    pub fn list_experiments(&self) -> StateResult<Vec<Experiment>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {EXPERIMENT_COLUMNS} FROM {EXPERIMENTS} ORDER BY id DESC");
        let mut stmt = conn.prepare(&sql).map_err(map_err!(Read))?;
        let rows = stmt
            .query_map([], experiment_from_row)
            .map_err(map_err!(Read))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_err!(Read))
    }

    /// Move an experiment `pending → running` and stamp `started_at`.
    ///
    /// A single conditional update: two concurrent callers cannot both
    /// observe `Applied`.
    pub fn begin_run(&self, id: ExperimentId, at: DateTime<Utc>) -> StateResult<Transition> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE experiments SET status = 'running', started_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, format_ts(at)],
            )
            .map_err(map_err!(Write))?;
        let transition = if changed == 1 {
            Transition::Applied
        } else {
            classify(&conn, id)?
        };
        debug!(experiment_id = id, ?transition, "begin_run");
        Ok(transition)
    }

    /// Move an experiment `running → completed|failed`, writing the terminal
    /// fields exactly once.
    pub fn finish_run(
        &self,
        id: ExperimentId,
        outcome: &RunOutcome,
        at: DateTime<Utc>,
    ) -> StateResult<Transition> {
        let conn = self.conn()?;
        let changed = match outcome {
            RunOutcome::Completed {
                final_accuracy,
                final_loss,
            } => conn.execute(
                "UPDATE experiments
                 SET status = 'completed', completed_at = ?2, final_accuracy = ?3, final_loss = ?4
                 WHERE id = ?1 AND status = 'running'",
                params![id, format_ts(at), final_accuracy, final_loss],
            ),
            RunOutcome::Failed { error } => conn.execute(
                "UPDATE experiments
                 SET status = 'failed', completed_at = ?2, error_message = ?3
                 WHERE id = ?1 AND status = 'running'",
                params![id, format_ts(at), error],
            ),
        }
        .map_err(map_err!(Write))?;
        let transition = if changed == 1 {
            Transition::Applied
        } else {
            classify(&conn, id)?
        };
        debug!(experiment_id = id, status = %outcome.status(), ?transition, "finish_run");
        Ok(transition)
    }

    /// Append text to the experiment's execution log. Returns false if absent.
    pub fn append_log(&self, id: ExperimentId, text: &str) -> StateResult<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE experiments SET logs = logs || ?2 WHERE id = ?1",
                params![id, text],
            )
            .map_err(map_err!(Write))?;
        Ok(changed == 1)
    }

    /// Delete an experiment; its metric and checkpoint rows go with it.
    /// Returns true if it existed.
    pub fn delete_experiment(&self, id: ExperimentId) -> StateResult<bool> {
        let conn = self.conn()?;
        let existed = conn
            .execute("DELETE FROM experiments WHERE id = ?1", params![id])
            .map_err(map_err!(Write))?
            == 1;
        debug!(experiment_id = id, existed, "experiment deleted");
        Ok(existed)
    }

    // ── Metrics ────────────────────────────────────────────────────

    /// Append a metric row (worker side of the contract).
    pub fn insert_metric(&self, metric: &NewMetric) -> StateResult<Metric> {
        let client_metrics =
            serde_json::to_string(&metric.client_metrics).map_err(map_err!(Serialize))?;
        let created_at = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO metrics (experiment_id, round, train_loss, train_accuracy,
                                  eval_loss, eval_accuracy, client_metrics, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                metric.experiment_id,
                metric.round,
                metric.train_loss,
                metric.train_accuracy,
                metric.eval_loss,
                metric.eval_accuracy,
                client_metrics,
                format_ts(created_at),
            ],
        )
        .map_err(map_err!(Write))?;
        Ok(Metric {
            id: conn.last_insert_rowid(),
            experiment_id: metric.experiment_id,
            round: metric.round,
            train_loss: metric.train_loss,
            train_accuracy: metric.train_accuracy,
            eval_loss: metric.eval_loss,
            eval_accuracy: metric.eval_accuracy,
            client_metrics: metric.client_metrics.clone(),
            created_at,
        })
    }

    /// The metric with the highest round; the later insert wins on ties.
    pub fn latest_metric(&self, experiment_id: ExperimentId) -> StateResult<Option<Metric>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {METRIC_COLUMNS} FROM {METRICS}
             WHERE experiment_id = ?1 ORDER BY round DESC, id DESC LIMIT 1"
        );
        conn.query_row(&sql, params![experiment_id], metric_from_row)
            .optional()
            .map_err(map_err!(Read))
    }

    /// All metric rows for an experiment in round order.
    pub fn list_metrics(&self, experiment_id: ExperimentId) -> StateResult<Vec<Metric>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {METRIC_COLUMNS} FROM {METRICS}
             WHERE experiment_id = ?1 ORDER BY round ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(map_err!(Read))?;
        let rows = stmt
            .query_map(params![experiment_id], metric_from_row)
            .map_err(map_err!(Read))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_err!(Read))
    }

    // ── Checkpoints ────────────────────────────────────────────────

    /// Record a checkpoint row (worker side of the contract).
    pub fn insert_checkpoint(&self, checkpoint: &NewCheckpoint) -> StateResult<Checkpoint> {
        let created_at = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO model_checkpoints (experiment_id, round, file_path, accuracy, loss, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                checkpoint.experiment_id,
                checkpoint.round,
                checkpoint.file_path,
                checkpoint.accuracy,
                checkpoint.loss,
                format_ts(created_at),
            ],
        )
        .map_err(map_err!(Write))?;
        Ok(Checkpoint {
            id: conn.last_insert_rowid(),
            experiment_id: checkpoint.experiment_id,
            round: checkpoint.round,
            file_path: checkpoint.file_path.clone(),
            accuracy: checkpoint.accuracy,
            loss: checkpoint.loss,
            created_at,
        })
    }

    /// Get one checkpoint, scoped to its experiment.
    pub fn get_checkpoint(
        &self,
        experiment_id: ExperimentId,
        checkpoint_id: i64,
    ) -> StateResult<Option<Checkpoint>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM {CHECKPOINTS}
             WHERE experiment_id = ?1 AND id = ?2"
        );
        conn.query_row(&sql, params![experiment_id, checkpoint_id], checkpoint_from_row)
            .optional()
            .map_err(map_err!(Read))
    }

    /// All checkpoints for an experiment in round order.
    pub fn list_checkpoints(&self, experiment_id: ExperimentId) -> StateResult<Vec<Checkpoint>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM {CHECKPOINTS}
             WHERE experiment_id = ?1 ORDER BY round ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(map_err!(Read))?;
        let rows = stmt
            .query_map(params![experiment_id], checkpoint_from_row)
            .map_err(map_err!(Read))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_err!(Read))
    }
}

// ── Row mapping ────────────────────────────────────────────────────

fn fetch_experiment(conn: &Connection, id: ExperimentId) -> StateResult<Option<Experiment>> {
    let sql = format!("SELECT {EXPERIMENT_COLUMNS} FROM {EXPERIMENTS} WHERE id = ?1");
    conn.query_row(&sql, params![id], experiment_from_row)
        .optional()
        .map_err(map_err!(Read))
}

/// Explain why a conditional status update touched no row.
fn classify(conn: &Connection, id: ExperimentId) -> StateResult<Transition> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM experiments WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_err!(Read))?;
    match status {
        Some(s) => Ok(Transition::Rejected(s.parse()?)),
        None => Ok(Transition::Missing),
    }
}

fn experiment_from_row(row: &Row<'_>) -> rusqlite::Result<Experiment> {
    let status: String = row.get(4)?;
    let status = status
        .parse::<ExperimentStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(Experiment {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        framework: row.get(3)?,
        status,
        artifacts: ArtifactRefs {
            algorithm_path: row.get(5)?,
            model_path: row.get(6)?,
            config_path: row.get(7)?,
            dataset_path: row.get(8)?,
        },
        training: TrainingParams {
            num_clients: row.get(9)?,
            num_rounds: row.get(10)?,
            client_fraction: row.get(11)?,
            local_epochs: row.get(12)?,
            learning_rate: row.get(13)?,
        },
        resources: ResourceHints {
            use_gpu: row.get(14)?,
            cpus_per_client: row.get(15)?,
            gpu_fraction_per_client: row.get(16)?,
        },
        config_json: json_column(row, 17)?,
        created_at: ts_column(row, 18)?,
        started_at: opt_ts_column(row, 19)?,
        completed_at: opt_ts_column(row, 20)?,
        final_accuracy: row.get(21)?,
        final_loss: row.get(22)?,
        error_message: row.get(23)?,
        logs: row.get(24)?,
    })
}

fn metric_from_row(row: &Row<'_>) -> rusqlite::Result<Metric> {
    Ok(Metric {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        round: row.get(2)?,
        train_loss: row.get(3)?,
        train_accuracy: row.get(4)?,
        eval_loss: row.get(5)?,
        eval_accuracy: row.get(6)?,
        client_metrics: json_column(row, 7)?,
        created_at: ts_column(row, 8)?,
    })
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        id: row.get(0)?,
        experiment_id: row.get(1)?,
        round: row.get(2)?,
        file_path: row.get(3)?,
        accuracy: row.get(4)?,
        loss: row.get(5)?,
        created_at: ts_column(row, 6)?,
    })
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_ts(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            Box::new(StateError::Invalid(format!("bad timestamp {text:?}"))),
        )
    })
}

fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    match text {
        Some(_) => ts_column(row, idx).map(Some),
        None => Ok(None),
    }
}

fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339()
}

/// Naive layouts workers write, read as UTC: SQLite's `CURRENT_TIMESTAMP`
/// and ISO 8601 without an offset.
const NAIVE_TS_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

fn parse_ts(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_TS_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_experiment(name: &str, rounds: u32) -> NewExperiment {
        NewExperiment {
            name: name.to_string(),
            description: Some("test run".to_string()),
            framework: "pytorch".to_string(),
            artifacts: ArtifactRefs {
                algorithm_path: Some("algorithms/fedavg.py".to_string()),
                ..ArtifactRefs::default()
            },
            training: TrainingParams {
                num_clients: 5,
                num_rounds: rounds,
                client_fraction: 0.5,
                local_epochs: 2,
                learning_rate: 0.01,
            },
            resources: ResourceHints::default(),
            config_json: serde_json::json!({ "batch_size": 32 }),
        }
    }

    fn metric(experiment_id: ExperimentId, round: u32, eval_accuracy: f64) -> NewMetric {
        NewMetric {
            eval_accuracy: Some(eval_accuracy),
            ..NewMetric::for_round(experiment_id, round)
        }
    }

    fn checkpoint(experiment_id: ExperimentId, round: u32) -> NewCheckpoint {
        NewCheckpoint {
            experiment_id,
            round,
            file_path: format!("exp_{experiment_id}/round_{round}.pt"),
            accuracy: Some(0.5),
            loss: Some(1.0),
        }
    }

    // ── Experiments ────────────────────────────────────────────────

    #[test]
    fn experiment_insert_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let created = store.insert_experiment(&new_experiment("mnist", 3)).unwrap();

        assert_eq!(created.status, ExperimentStatus::Pending);
        assert!(created.started_at.is_none());
        assert!(created.completed_at.is_none());
        assert_eq!(created.config_json, serde_json::json!({ "batch_size": 32 }));

        let fetched = store.get_experiment(created.id).unwrap();
        assert_eq!(fetched, Some(created));
    }

    #[test]
    fn experiment_insert_rejects_invalid_request() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.insert_experiment(&new_experiment("bad", 0)).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
        assert!(store.list_experiments().unwrap().is_empty());
    }

    #[test]
    fn experiment_list_newest_first() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.insert_experiment(&new_experiment("a", 1)).unwrap();
        let b = store.insert_experiment(&new_experiment("b", 1)).unwrap();

        let ids: Vec<_> = store.list_experiments().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_experiment(42).unwrap().is_none());
    }

    // ── Status transitions ─────────────────────────────────────────

    #[test]
    fn begin_run_applies_once() {
        let store = StateStore::open_in_memory().unwrap();
        let exp = store.insert_experiment(&new_experiment("run", 3)).unwrap();

        assert_eq!(store.begin_run(exp.id, Utc::now()).unwrap(), Transition::Applied);
        let first_start = store.get_experiment(exp.id).unwrap().unwrap().started_at;
        assert!(first_start.is_some());

        assert_eq!(
            store.begin_run(exp.id, Utc::now()).unwrap(),
            Transition::Rejected(ExperimentStatus::Running)
        );
        // started_at is untouched by the rejected attempt.
        let after = store.get_experiment(exp.id).unwrap().unwrap();
        assert_eq!(after.started_at, first_start);
        assert_eq!(after.status, ExperimentStatus::Running);
    }

    #[test]
    fn begin_run_missing_experiment() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.begin_run(42, Utc::now()).unwrap(), Transition::Missing);
    }

    #[test]
    fn finish_run_requires_running() {
        let store = StateStore::open_in_memory().unwrap();
        let exp = store.insert_experiment(&new_experiment("run", 3)).unwrap();
        let done = RunOutcome::Completed {
            final_accuracy: Some(0.91),
            final_loss: Some(0.2),
        };

        assert_eq!(
            store.finish_run(exp.id, &done, Utc::now()).unwrap(),
            Transition::Rejected(ExperimentStatus::Pending)
        );

        store.begin_run(exp.id, Utc::now()).unwrap();
        assert_eq!(store.finish_run(exp.id, &done, Utc::now()).unwrap(), Transition::Applied);

        let finished = store.get_experiment(exp.id).unwrap().unwrap();
        assert_eq!(finished.status, ExperimentStatus::Completed);
        assert_eq!(finished.final_accuracy, Some(0.91));
        assert!(finished.completed_at.is_some());
        assert!(finished.error_message.is_none());
    }

    #[test]
    fn terminal_state_is_final() {
        let store = StateStore::open_in_memory().unwrap();
        let exp = store.insert_experiment(&new_experiment("run", 3)).unwrap();
        store.begin_run(exp.id, Utc::now()).unwrap();

        let failed = RunOutcome::Failed {
            error: "RuntimeError: CUDA out of memory".to_string(),
        };
        assert_eq!(store.finish_run(exp.id, &failed, Utc::now()).unwrap(), Transition::Applied);
        let completed_at = store.get_experiment(exp.id).unwrap().unwrap().completed_at;

        // Neither a second finish nor a restart can move it.
        let done = RunOutcome::Completed {
            final_accuracy: None,
            final_loss: None,
        };
        assert_eq!(
            store.finish_run(exp.id, &done, Utc::now()).unwrap(),
            Transition::Rejected(ExperimentStatus::Failed)
        );
        assert_eq!(
            store.begin_run(exp.id, Utc::now()).unwrap(),
            Transition::Rejected(ExperimentStatus::Failed)
        );

        let after = store.get_experiment(exp.id).unwrap().unwrap();
        assert_eq!(after.status, ExperimentStatus::Failed);
        assert_eq!(after.completed_at, completed_at);
        assert_eq!(after.error_message.as_deref(), Some("RuntimeError: CUDA out of memory"));
    }

    #[test]
    fn append_log_accumulates() {
        let store = StateStore::open_in_memory().unwrap();
        let exp = store.insert_experiment(&new_experiment("log", 1)).unwrap();

        assert!(store.append_log(exp.id, "round 1\n").unwrap());
        assert!(store.append_log(exp.id, "round 2\n").unwrap());
        assert!(!store.append_log(999, "nobody\n").unwrap());

        let logs = store.get_experiment(exp.id).unwrap().unwrap().logs;
        assert_eq!(logs, "round 1\nround 2\n");
    }

    // ── Metrics ────────────────────────────────────────────────────

    #[test]
    fn latest_metric_picks_highest_round() {
        let store = StateStore::open_in_memory().unwrap();
        let exp = store.insert_experiment(&new_experiment("m", 5)).unwrap();

        assert!(store.latest_metric(exp.id).unwrap().is_none());

        store.insert_metric(&metric(exp.id, 1, 0.3)).unwrap();
        store.insert_metric(&metric(exp.id, 3, 0.6)).unwrap();
        store.insert_metric(&metric(exp.id, 2, 0.5)).unwrap();

        let latest = store.latest_metric(exp.id).unwrap().unwrap();
        assert_eq!(latest.round, 3);
        assert_eq!(latest.eval_accuracy, Some(0.6));

        let rounds: Vec<_> = store.list_metrics(exp.id).unwrap().iter().map(|m| m.round).collect();
        assert_eq!(rounds, vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_rounds_latest_insert_wins() {
        let store = StateStore::open_in_memory().unwrap();
        let exp = store.insert_experiment(&new_experiment("dup", 2)).unwrap();

        store.insert_metric(&metric(exp.id, 2, 0.4)).unwrap();
        let second = store.insert_metric(&metric(exp.id, 2, 0.45)).unwrap();

        let latest = store.latest_metric(exp.id).unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.eval_accuracy, Some(0.45));
    }

    #[test]
    fn metric_requires_existing_experiment() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.insert_metric(&metric(77, 1, 0.1)).unwrap_err();
        assert!(matches!(err, StateError::Write(_)));
    }

    #[test]
    fn partial_metrics_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        let exp = store.insert_experiment(&new_experiment("partial", 1)).unwrap();
        let inserted = store
            .insert_metric(&NewMetric {
                train_loss: Some(1.25),
                client_metrics: serde_json::json!([{ "client_id": 0, "loss": 1.3 }]),
                ..NewMetric::for_round(exp.id, 1)
            })
            .unwrap();

        let latest = store.latest_metric(exp.id).unwrap().unwrap();
        assert_eq!(latest.id, inserted.id);
        assert_eq!(latest.train_loss, Some(1.25));
        assert_eq!(latest.eval_loss, None);
        assert_eq!(latest.client_metrics[0]["client_id"], 0);
    }

    // ── Checkpoints ────────────────────────────────────────────────

    #[test]
    fn checkpoint_insert_get_list() {
        let store = StateStore::open_in_memory().unwrap();
        let exp = store.insert_experiment(&new_experiment("ckpt", 2)).unwrap();
        let other = store.insert_experiment(&new_experiment("other", 2)).unwrap();

        let first = store.insert_checkpoint(&checkpoint(exp.id, 1)).unwrap();
        store.insert_checkpoint(&checkpoint(exp.id, 2)).unwrap();

        let fetched = store.get_checkpoint(exp.id, first.id).unwrap().unwrap();
        assert_eq!(fetched.file_path, format!("exp_{}/round_1.pt", exp.id));
        // Scoped to its own experiment.
        assert!(store.get_checkpoint(other.id, first.id).unwrap().is_none());

        assert_eq!(store.list_checkpoints(exp.id).unwrap().len(), 2);
    }

    // ── Deletion ───────────────────────────────────────────────────

    #[test]
    fn delete_cascades_to_metrics_and_checkpoints() {
        let store = StateStore::open_in_memory().unwrap();
        let exp = store.insert_experiment(&new_experiment("gone", 2)).unwrap();
        let keep = store.insert_experiment(&new_experiment("keep", 2)).unwrap();
        for round in 1..=2 {
            store.insert_metric(&metric(exp.id, round, 0.5)).unwrap();
            store.insert_checkpoint(&checkpoint(exp.id, round)).unwrap();
        }
        store.insert_metric(&metric(keep.id, 1, 0.5)).unwrap();

        assert!(store.delete_experiment(exp.id).unwrap());
        assert!(!store.delete_experiment(exp.id).unwrap());

        assert!(store.get_experiment(exp.id).unwrap().is_none());
        assert!(store.list_metrics(exp.id).unwrap().is_empty());
        assert!(store.list_checkpoints(exp.id).unwrap().is_empty());
        // Other experiments untouched.
        assert_eq!(store.list_metrics(keep.id).unwrap().len(), 1);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.sqlite");

        let id = {
            let store = StateStore::open(&db_path).unwrap();
            store.insert_experiment(&new_experiment("durable", 2)).unwrap().id
        };

        let store = StateStore::open(&db_path).unwrap();
        let exp = store.get_experiment(id).unwrap().unwrap();
        assert_eq!(exp.name, "durable");
    }

    #[test]
    fn second_handle_sees_worker_writes() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("shared.sqlite");

        let daemon = StateStore::open(&db_path).unwrap();
        let exp = daemon.insert_experiment(&new_experiment("shared", 2)).unwrap();
        daemon.begin_run(exp.id, Utc::now()).unwrap();

        // A separate connection stands in for the worker process.
        let worker = StateStore::open(&db_path).unwrap();
        worker.insert_metric(&metric(exp.id, 1, 0.7)).unwrap();
        worker
            .finish_run(
                exp.id,
                &RunOutcome::Completed {
                    final_accuracy: Some(0.7),
                    final_loss: None,
                },
                Utc::now(),
            )
            .unwrap();

        assert_eq!(daemon.latest_metric(exp.id).unwrap().unwrap().round, 1);
        assert_eq!(
            daemon.get_experiment(exp.id).unwrap().unwrap().status,
            ExperimentStatus::Completed
        );
    }

    #[test]
    fn parses_sqlite_default_timestamps() {
        let parsed = parse_ts("2024-05-01 12:30:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-05-01T12:30:00+00:00");
        let parsed = parse_ts("2024-05-01T12:30:00.123456").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-05-01T12:30:00.123456+00:00");
        assert!(parse_ts("yesterday").is_none());
    }

    #[test]
    fn naive_iso_timestamp_from_worker_is_readable() {
        let store = StateStore::open_in_memory().unwrap();
        let exp = store.insert_experiment(&new_experiment("naive", 1)).unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE experiments SET status = 'completed',
                        started_at = '2024-05-01T12:00:00',
                        completed_at = '2024-05-01T12:30:00.123456'
                 WHERE id = ?1",
                params![exp.id],
            )
            .unwrap();

        let loaded = store.get_experiment(exp.id).unwrap().unwrap();
        assert_eq!(loaded.status, ExperimentStatus::Completed);
        assert_eq!(
            loaded.completed_at.unwrap().to_rfc3339(),
            "2024-05-01T12:30:00.123456+00:00"
        );
        assert!(store.delete_experiment(exp.id).unwrap());
    }
}
