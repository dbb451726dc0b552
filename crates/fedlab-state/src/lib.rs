//! fedlab-state — the record store shared by the orchestrator and workers.
//!
//! Backed by SQLite through [rusqlite](https://docs.rs/rusqlite). Unlike an
//! embedded single-process store, SQLite lets the detached worker process
//! open the same database file while the daemon keeps serving reads.
//!
//! # Contract with the worker
//!
//! The orchestrator and the worker never talk directly. They agree on the
//! schema in [`schema`]:
//!
//! - the orchestrator inserts experiments and moves them `pending → running`
//! - the worker appends metric and checkpoint rows with non-decreasing round
//!   numbers, then flips the experiment to `completed` or `failed` once
//! - deleting an experiment cascades to its metric and checkpoint rows
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Mutex<Connection>>`) and can be shared across async tasks.

pub mod error;
pub mod schema;
pub mod store;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
