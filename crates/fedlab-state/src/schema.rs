//! SQLite schema shared by the orchestrator and the worker.
//!
//! Timestamps are stored as RFC 3339 text. `client_metrics` and
//! `config_json` hold JSON text. Metric and checkpoint rows reference their
//! experiment with `ON DELETE CASCADE`, which only takes effect while
//! `PRAGMA foreign_keys` is on for the deleting connection.

/// Experiment rows, one per submitted job.
pub const EXPERIMENTS: &str = "experiments";

/// Per-round metric rows, append-only.
pub const METRICS: &str = "metrics";

/// Per-round checkpoint rows, append-only.
pub const CHECKPOINTS: &str = "model_checkpoints";

/// `CREATE … IF NOT EXISTS` for every table and index.
pub const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS experiments (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    name                    TEXT    NOT NULL,
    description             TEXT,
    framework               TEXT    NOT NULL,
    status                  TEXT    NOT NULL DEFAULT 'pending'
                            CHECK (status IN ('pending', 'running', 'completed', 'failed')),
    algorithm_path          TEXT,
    model_path              TEXT,
    config_path             TEXT,
    dataset_path            TEXT,
    num_clients             INTEGER NOT NULL CHECK (num_clients > 0),
    num_rounds              INTEGER NOT NULL CHECK (num_rounds > 0),
    client_fraction         REAL    NOT NULL,
    local_epochs            INTEGER NOT NULL,
    learning_rate           REAL    NOT NULL,
    use_gpu                 INTEGER NOT NULL DEFAULT 0,
    cpus_per_client         REAL    NOT NULL DEFAULT 1,
    gpu_fraction_per_client REAL    NOT NULL DEFAULT 0,
    config_json             TEXT    NOT NULL DEFAULT '{}',
    created_at              TEXT    NOT NULL,
    started_at              TEXT,
    completed_at            TEXT,
    final_accuracy          REAL,
    final_loss              REAL,
    error_message           TEXT,
    logs                    TEXT    NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS metrics (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_id  INTEGER NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
    round          INTEGER NOT NULL CHECK (round > 0),
    train_loss     REAL,
    train_accuracy REAL,
    eval_loss      REAL,
    eval_accuracy  REAL,
    client_metrics TEXT    NOT NULL DEFAULT '[]',
    created_at     TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS metrics_experiment_round
    ON metrics (experiment_id, round);

CREATE TABLE IF NOT EXISTS model_checkpoints (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_id INTEGER NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
    round         INTEGER NOT NULL CHECK (round > 0),
    file_path     TEXT    NOT NULL,
    accuracy      REAL,
    loss          REAL,
    created_at    TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS model_checkpoints_experiment_round
    ON model_checkpoints (experiment_id, round);
";

/// Column list for experiment reads, in the order `experiment_from_row` expects.
pub const EXPERIMENT_COLUMNS: &str = "id, name, description, framework, status, \
    algorithm_path, model_path, config_path, dataset_path, \
    num_clients, num_rounds, client_fraction, local_epochs, learning_rate, \
    use_gpu, cpus_per_client, gpu_fraction_per_client, config_json, \
    created_at, started_at, completed_at, final_accuracy, final_loss, \
    error_message, logs";

pub const METRIC_COLUMNS: &str = "id, experiment_id, round, train_loss, train_accuracy, \
    eval_loss, eval_accuracy, client_metrics, created_at";

pub const CHECKPOINT_COLUMNS: &str =
    "id, experiment_id, round, file_path, accuracy, loss, created_at";
