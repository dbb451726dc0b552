//! Process supervisor — launches the external worker for one experiment.
//!
//! The worker runs fully detached: its own process group, no stdin, and it is
//! never killed when the handle goes away. The only argument it receives is
//! the experiment ID; everything else it reads from the record store. The
//! supervisor does not watch the worker beyond reaping it and logging the
//! exit status. What happened to the run is learned from the store.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use fedlab_core::WorkerConfig;
use fedlab_state::ExperimentId;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactRoots;
use crate::error::{OrchestratorError, OrchestratorResult};

/// Environment variable carrying the record store location to the worker.
pub const ENV_DATABASE: &str = "FEDLAB_DATABASE";

/// Environment variable carrying the experiment's checkpoint directory.
pub const ENV_CHECKPOINT_DIR: &str = "FEDLAB_CHECKPOINT_DIR";

/// File inside the checkpoint directory receiving worker stdout/stderr.
pub const WORKER_LOG_FILE: &str = "worker.log";

/// A worker that has been handed to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedWorker {
    pub experiment_id: ExperimentId,
    pub pid: Option<u32>,
}

/// Starts a worker for an experiment and returns without waiting for it.
///
/// Any error means no worker is running for that experiment.
pub trait Launcher: Send + Sync {
    fn launch(&self, experiment_id: ExperimentId) -> OrchestratorResult<LaunchedWorker>;
}

/// Resolved program and entry script.
#[derive(Debug, Clone, PartialEq)]
struct WorkerCommand {
    program: PathBuf,
    script: Option<PathBuf>,
}

/// Spawns worker processes as described by `[worker]` in the config.
pub struct ProcessSupervisor {
    worker: WorkerConfig,
    roots: ArtifactRoots,
    database_path: PathBuf,
}

impl ProcessSupervisor {
    pub fn new(worker: WorkerConfig, roots: ArtifactRoots, database_path: impl Into<PathBuf>) -> Self {
        Self {
            worker,
            roots,
            database_path: database_path.into(),
        }
    }

    /// Find the program and script, failing before anything is spawned.
    fn locate(&self) -> OrchestratorResult<WorkerCommand> {
        let program = match &self.worker.venv {
            Some(venv) => {
                if !venv.is_dir() {
                    return Err(OrchestratorError::Spawn(format!(
                        "worker environment not found: {}",
                        venv.display()
                    )));
                }
                let candidate = venv.join("bin").join(&self.worker.program);
                if !candidate.is_file() {
                    return Err(OrchestratorError::Spawn(format!(
                        "worker executable not found: {}",
                        candidate.display()
                    )));
                }
                candidate
            }
            None => {
                let program = Path::new(&self.worker.program);
                if program.components().count() > 1 {
                    if !program.is_file() {
                        return Err(OrchestratorError::Spawn(format!(
                            "worker executable not found: {}",
                            program.display()
                        )));
                    }
                    program.to_path_buf()
                } else {
                    find_in_path(&self.worker.program).ok_or_else(|| {
                        OrchestratorError::Spawn(format!(
                            "worker executable {:?} not found on PATH",
                            self.worker.program
                        ))
                    })?
                }
            }
        };

        let script = match &self.worker.script {
            Some(script) => {
                let resolved = match &self.worker.working_dir {
                    Some(dir) if script.is_relative() => dir.join(script),
                    _ => script.clone(),
                };
                if !resolved.is_file() {
                    return Err(OrchestratorError::Spawn(format!(
                        "worker script not found: {}",
                        resolved.display()
                    )));
                }
                Some(script.clone())
            }
            None => None,
        };

        Ok(WorkerCommand { program, script })
    }

    /// Where the worker's output goes: `worker.log` or nowhere.
    fn output(&self, checkpoint_dir: &Path) -> OrchestratorResult<(Stdio, Stdio)> {
        if !self.worker.capture_output {
            return Ok((Stdio::null(), Stdio::null()));
        }
        let log_path = checkpoint_dir.join(WORKER_LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| {
                OrchestratorError::Spawn(format!("cannot open {}: {e}", log_path.display()))
            })?;
        let stderr = file
            .try_clone()
            .map_err(|e| OrchestratorError::Spawn(format!("cannot clone log handle: {e}")))?;
        Ok((Stdio::from(file), Stdio::from(stderr)))
    }
}

impl Launcher for ProcessSupervisor {
    fn launch(&self, experiment_id: ExperimentId) -> OrchestratorResult<LaunchedWorker> {
        let cmd = self.locate()?;

        // Created before the spawn so the worker can write into it unconditionally.
        let checkpoint_dir = absolute(&self.roots.checkpoint_dir(experiment_id));
        std::fs::create_dir_all(&checkpoint_dir).map_err(|e| {
            OrchestratorError::Spawn(format!(
                "cannot create checkpoint dir {}: {e}",
                checkpoint_dir.display()
            ))
        })?;
        let (stdout, stderr) = self.output(&checkpoint_dir)?;

        let mut command = Command::new(&cmd.program);
        if let Some(script) = &cmd.script {
            command.arg(script);
        }
        command
            .arg(experiment_id.to_string())
            .env(ENV_DATABASE, absolute(&self.database_path))
            .env(ENV_CHECKPOINT_DIR, &checkpoint_dir)
            .envs(&self.worker.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false);
        if let Some(dir) = &self.worker.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            OrchestratorError::Spawn(format!("{}: {e}", cmd.program.display()))
        })?;
        let pid = child.id();
        info!(experiment_id, ?pid, program = %cmd.program.display(), "worker spawned");

        // Reap the child so it never lingers as a zombie; the status is informational.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    info!(experiment_id, ?pid, "worker exited")
                }
                Ok(status) => {
                    warn!(experiment_id, ?pid, %status, "worker exited with failure status")
                }
                Err(e) => warn!(experiment_id, ?pid, error = %e, "failed to wait on worker"),
            }
        });

        Ok(LaunchedWorker { experiment_id, pid })
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    let found = std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file());
    debug!(%name, ?found, "searched PATH for worker");
    found
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
