//! Server-Sent Events endpoint for live experiment progress.
//!
//! Each connection gets its own feed subscription. When the client goes
//! away axum drops the stream, which closes the channel and stops the
//! polling loop on its next wake-up.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use fedlab_orchestrator::OrchestratorError;
use fedlab_state::ExperimentId;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::ApiState;
use crate::handlers::orchestrator_error;

/// SSE event name carried by every progress message.
pub const UPDATE_EVENT: &str = "update";

/// GET /api/v1/experiments/{id}/stream
pub async fn stream_experiment(
    State(state): State<ApiState>,
    Path(id): Path<ExperimentId>,
) -> Response {
    // Unknown experiments get a 404 instead of an empty stream.
    match state.orchestrator.store().get_experiment(id) {
        Ok(Some(_)) => {}
        Ok(None) => return orchestrator_error(&OrchestratorError::NotFound(id)),
        Err(e) => return orchestrator_error(&OrchestratorError::from(e)),
    }

    debug!(experiment_id = id, "progress stream opened");
    let events = state
        .orchestrator
        .subscribe(id)
        .filter_map(move |update| match Event::default().event(UPDATE_EVENT).json_data(&update) {
            Ok(event) => Some(Ok::<_, Infallible>(event)),
            Err(e) => {
                warn!(experiment_id = id, error = %e, "failed to encode progress event");
                None
            }
        });

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::StatusCode;
    use chrono::Utc;
    use fedlab_orchestrator::*;
    use fedlab_state::*;

    struct NoopLauncher;

    impl Launcher for NoopLauncher {
        fn launch(&self, experiment_id: ExperimentId) -> OrchestratorResult<LaunchedWorker> {
            Ok(LaunchedWorker {
                experiment_id,
                pid: None,
            })
        }
    }

    fn test_state(dir: &std::path::Path) -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        let feed = ProgressFeed::new(store.clone(), Duration::from_millis(10));
        ApiState {
            orchestrator: Arc::new(Orchestrator::new(
                store,
                ArtifactRoots::new(dir.join("checkpoints"), dir.join("uploads")),
                Arc::new(NoopLauncher),
                feed,
            )),
        }
    }

    #[tokio::test]
    async fn stream_missing_experiment_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let resp = stream_experiment(State(test_state(dir.path())), Path(99)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stream_terminal_experiment_sends_final_update() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let store = state.orchestrator.store().clone();
        let exp = store
            .insert_experiment(
                &serde_json::from_value(serde_json::json!({
                    "name": "done",
                    "training": { "num_clients": 2, "num_rounds": 1 }
                }))
                .unwrap(),
            )
            .unwrap();
        store.begin_run(exp.id, Utc::now()).unwrap();
        store.insert_metric(&NewMetric::for_round(exp.id, 1)).unwrap();
        store
            .finish_run(
                exp.id,
                &RunOutcome::Completed {
                    final_accuracy: Some(0.88),
                    final_loss: None,
                },
                Utc::now(),
            )
            .unwrap();

        let resp = stream_experiment(State(state), Path(exp.id)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(text.matches("event: update").count(), 1);
        assert!(text.contains("\"final\":true"));
        assert!(text.contains("\"final_accuracy\":0.88"));
    }
}
