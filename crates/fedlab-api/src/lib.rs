//! fedlab-api — REST API for fedlab.
//!
//! Provides axum route handlers for creating, starting, watching and
//! deleting experiments. Authentication is expected in front of this router.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/experiments` | List experiments |
//! | POST | `/api/v1/experiments` | Create an experiment |
//! | GET | `/api/v1/experiments/{id}` | Get experiment details |
//! | DELETE | `/api/v1/experiments/{id}` | Delete an experiment and its files |
//! | POST | `/api/v1/experiments/{id}/start` | Start the worker |
//! | GET | `/api/v1/experiments/{id}/stream` | Live progress (SSE) |
//! | GET | `/api/v1/experiments/{id}/metrics` | Metric rows |
//! | GET | `/api/v1/experiments/{id}/checkpoints` | Checkpoint rows |
//! | GET | `/api/v1/experiments/{id}/checkpoints/{checkpoint_id}/download` | Checkpoint file |
//! | GET | `/healthz` | Liveness |

pub mod handlers;
pub mod stream;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use fedlab_orchestrator::Orchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the complete API router.
pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    let api_state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route(
            "/experiments",
            get(handlers::list_experiments).post(handlers::create_experiment),
        )
        .route(
            "/experiments/{id}",
            get(handlers::get_experiment).delete(handlers::delete_experiment),
        )
        .route("/experiments/{id}/start", post(handlers::start_experiment))
        .route("/experiments/{id}/stream", get(stream::stream_experiment))
        .route("/experiments/{id}/metrics", get(handlers::list_metrics))
        .route("/experiments/{id}/checkpoints", get(handlers::list_checkpoints))
        .route(
            "/experiments/{id}/checkpoints/{checkpoint_id}/download",
            get(handlers::download_checkpoint),
        )
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
