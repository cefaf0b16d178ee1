//! Outbound mirror forwarding admitted events to an external full-text
//! search index.
//!
//! The mirror is feature-flagged by configuration: without an endpoint the
//! channel is simply never created. Forwarding is fire-and-forget; the
//! index being down never affects admission or broadcast.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::Event;

/// Depth of the forwarding queue; overflow drops events for the index,
/// never for the relay.
pub const MIRROR_QUEUE: usize = 1024;

/// Spawn the forwarder task and return the channel the ingester feeds.
pub fn spawn(endpoint: String) -> mpsc::Sender<Event> {
    let (tx, mut rx) = mpsc::channel::<Event>(MIRROR_QUEUE);
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        while let Some(ev) = rx.recv().await {
            match client.post(&endpoint).json(&ev).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(event = %ev.id, "event mirrored to search index");
                }
                Ok(resp) => {
                    warn!(event = %ev.id, status = %resp.status(), "search index refused event");
                }
                Err(e) => {
                    warn!(event = %ev.id, error = %e, "search index unreachable");
                }
            }
        }
    });
    tx
}
