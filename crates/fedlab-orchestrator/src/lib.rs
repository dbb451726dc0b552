//! fedlab-orchestrator — experiment lifecycle, worker supervision, live
//! progress and teardown.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator
//!   ├── LifecycleController   pending → running, rollback on launch failure
//!   │   └── Launcher (ProcessSupervisor) → detached worker process
//!   ├── ProgressFeed          one polling task per subscriber
//!   ├── TeardownCoordinator   files first, then the row (cascade)
//!   └── ArtifactRoots         checkpoint / uploads roots, path containment
//! ```
//!
//! The worker and the orchestrator never talk to each other. The worker gets
//! an experiment ID, reads its configuration from the record store, appends
//! metric and checkpoint rows, and writes the terminal status itself. The
//! orchestrator learns about all of it by reading the same store.

pub mod artifacts;
pub mod error;
pub mod feed;
pub mod lifecycle;
pub mod orchestrator;
pub mod supervisor;
pub mod teardown;

pub use artifacts::{resolve_within, ArtifactRoots};
pub use error::{OrchestratorError, OrchestratorResult};
pub use feed::{ProgressFeed, UpdateEvent};
pub use lifecycle::{LifecycleController, StartOutcome};
pub use orchestrator::{CheckpointFile, Orchestrator};
pub use supervisor::{
    LaunchedWorker, Launcher, ProcessSupervisor, ENV_CHECKPOINT_DIR, ENV_DATABASE,
    WORKER_LOG_FILE,
};
pub use teardown::{TeardownCoordinator, TeardownReport};
