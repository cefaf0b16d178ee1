//! Commit-ordered admission pipeline.
//!
//! All writes funnel through one ingester task: persist, then broadcast,
//! then acknowledge. Because a single task does both the commit and the
//! fan-out, live subscribers observe events in exactly the order a later
//! historical query would return them.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    event::Event,
    storage::{PutOutcome, Store},
    subs::Registry,
    validate::Rejection,
};

/// Depth of the admission queue feeding the ingester.
const INGEST_QUEUE: usize = 512;
/// Attempts against the store before a write is reported as failed.
const STORE_ATTEMPTS: usize = 3;

/// One validated event awaiting persistence, with a channel for the
/// publisher's acknowledgment.
pub struct IngestJob {
    pub event: Event,
    pub ack: oneshot::Sender<Result<PutOutcome, Rejection>>,
}

/// Handle used by connection handlers to submit validated events.
pub type IngestSender = mpsc::Sender<IngestJob>;

/// Start the ingester task and return its submission handle.
///
/// `mirror` receives a copy of every newly stored event when the external
/// search-index forwarder is configured.
pub fn spawn(store: Store, registry: Registry, mirror: Option<mpsc::Sender<Event>>) -> IngestSender {
    let (tx, mut rx) = mpsc::channel::<IngestJob>(INGEST_QUEUE);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let outcome = persist_with_retry(&store, &job.event);
            if matches!(outcome, Ok(PutOutcome::Stored)) {
                let delivered = registry.broadcast(&job.event);
                debug!(event = %job.event.id, delivered, "event admitted");
                if let Some(mirror) = &mirror {
                    // Fire and forget; a congested mirror never slows admission.
                    if mirror.try_send(job.event.clone()).is_err() {
                        warn!(event = %job.event.id, "mirror queue full, event not forwarded");
                    }
                }
            }
            // The publisher may already be gone; its ack is best-effort.
            let _ = job.ack.send(outcome);
        }
    });
    tx
}

fn persist_with_retry(store: &Store, ev: &Event) -> Result<PutOutcome, Rejection> {
    for attempt in 1..=STORE_ATTEMPTS {
        match store.put(ev) {
            Ok(outcome) => return Ok(outcome),
            Err(e) if attempt < STORE_ATTEMPTS => {
                warn!(event = %ev.id, attempt, error = %e, "store write failed, retrying");
            }
            Err(e) => {
                warn!(event = %ev.id, error = %e, "store write failed permanently");
            }
        }
    }
    Err(Rejection::Error("could not persist event".into()))
}
