//! Progress feed — one polling loop per subscriber.
//!
//! Each `subscribe` spawns a task that re-reads the experiment row and its
//! latest metric on a fixed interval and pushes an [`UpdateEvent`] into a
//! bounded channel whenever something changed. The stream ends when:
//!
//! - the experiment reaches a terminal status (one event with `final = true`)
//! - the experiment disappears
//! - the subscriber drops its end of the stream
//! - the daemon signals shutdown
//!
//! Subscriptions share nothing but the store handle, so any number of them
//! can watch the same experiment.

use std::time::Duration;

use fedlab_state::*;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Buffered events per subscriber before the loop waits on the reader.
const CHANNEL_CAPACITY: usize = 16;

/// One progress snapshot pushed to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub experiment_id: ExperimentId,
    pub status: ExperimentStatus,
    /// Highest round reported so far, 0 before the first metric row.
    pub current_round: u32,
    pub total_rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_metric: Option<Metric>,
    /// Set on the last event of a subscription.
    #[serde(rename = "final")]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Spawns per-subscriber polling loops over the record store.
#[derive(Clone)]
pub struct ProgressFeed {
    store: StateStore,
    interval: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl ProgressFeed {
    pub fn new(store: StateStore, interval: Duration) -> Self {
        Self {
            store,
            interval,
            shutdown: None,
        }
    }

    /// Stop every loop once `true` is sent on the channel.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start watching an experiment. Must be called inside a Tokio runtime.
    pub fn subscribe(&self, experiment_id: ExperimentId) -> ReceiverStream<UpdateEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run_feed_loop(
            experiment_id,
            self.store.clone(),
            self.interval,
            self.shutdown.clone(),
            tx,
        ));
        ReceiverStream::new(rx)
    }
}

/// What one poll produced.
enum Poll {
    Emit(UpdateEvent),
    Unchanged,
    Gone,
}

async fn run_feed_loop(
    experiment_id: ExperimentId,
    store: StateStore,
    interval: Duration,
    mut shutdown: Option<watch::Receiver<bool>>,
    tx: mpsc::Sender<UpdateEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tracker = FeedTracker::default();

    debug!(experiment_id, ?interval, "feed loop starting");

    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!(experiment_id, "subscriber disconnected");
                break;
            }
            _ = shutdown_signalled(&mut shutdown) => {
                debug!(experiment_id, "feed loop shutting down");
                break;
            }
            _ = ticker.tick() => {}
        }

        match poll(&store, experiment_id, &mut tracker) {
            Ok(Poll::Emit(event)) => {
                let is_final = event.is_final;
                debug!(experiment_id, round = event.current_round, status = %event.status, is_final, "feed update");
                if tx.send(event).await.is_err() {
                    debug!(experiment_id, "subscriber disconnected");
                    break;
                }
                if is_final {
                    info!(experiment_id, "experiment finished, closing feed");
                    break;
                }
            }
            Ok(Poll::Unchanged) => {}
            Ok(Poll::Gone) => {
                debug!(experiment_id, "experiment not found, closing feed");
                break;
            }
            Err(e) => {
                warn!(experiment_id, error = %e, "feed read failed, retrying next tick");
            }
        }
    }
}

fn poll(
    store: &StateStore,
    experiment_id: ExperimentId,
    tracker: &mut FeedTracker,
) -> StateResult<Poll> {
    let Some(experiment) = store.get_experiment(experiment_id)? else {
        return Ok(Poll::Gone);
    };
    let metric = store.latest_metric(experiment_id)?;
    Ok(match tracker.observe(&experiment, metric) {
        Some(event) => Poll::Emit(event),
        None => Poll::Unchanged,
    })
}

/// Resolves once shutdown is requested; never resolves without a receiver.
async fn shutdown_signalled(shutdown: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = shutdown else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without signalling: nothing will ever stop us here.
            return std::future::pending().await;
        }
    }
}

/// Remembers what a subscriber has seen and keeps its view monotonic.
#[derive(Debug, Default)]
struct FeedTracker {
    status: Option<ExperimentStatus>,
    metric: Option<Metric>,
}

impl FeedTracker {
    /// Fold in a fresh read; returns an event if the subscriber's view changed.
    fn observe(&mut self, experiment: &Experiment, metric: Option<Metric>) -> Option<UpdateEvent> {
        let first = self.status.is_none();

        let status = match self.status {
            Some(prev) if experiment.status.rank() < prev.rank() => prev,
            _ => experiment.status,
        };
        let status_changed = self.status != Some(status);

        let mut metric_changed = false;
        if let Some(fresh) = metric {
            let seen_round = self.metric.as_ref().map_or(0, |m| m.round);
            let seen_id = self.metric.as_ref().map(|m| m.id);
            if fresh.round >= seen_round && seen_id != Some(fresh.id) {
                self.metric = Some(fresh);
                metric_changed = true;
            }
        }
        self.status = Some(status);

        let is_final = status.is_terminal();
        if !(first || status_changed || metric_changed || is_final) {
            return None;
        }

        Some(UpdateEvent {
            experiment_id: experiment.id,
            status,
            current_round: self.metric.as_ref().map_or(0, |m| m.round),
            total_rounds: experiment.training.num_rounds,
            latest_metric: self.metric.clone(),
            is_final,
            final_accuracy: if is_final { experiment.final_accuracy } else { None },
            final_loss: if is_final { experiment.final_loss } else { None },
            error_message: if is_final {
                experiment.error_message.clone()
            } else {
                None
            },
        })
    }
}
