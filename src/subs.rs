//! Live subscription registry and broadcast matcher.
//!
//! The registry is sharded per connection: broadcast iterates connections
//! and takes only short per-connection locks, so registering or removing a
//! subscription on one socket never stalls delivery to the others.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::{event::Event, filter::Filter, storage::unix_now};

/// Capacity of each connection's outbound frame queue. A consumer that
/// falls this far behind is disconnected instead of buffered further.
pub const OUTBOUND_QUEUE: usize = 256;

struct ConnEntry {
    sender: mpsc::Sender<String>,
    kick: Arc<Notify>,
    subs: Mutex<HashMap<String, Vec<Filter>>>,
}

/// Shared registry of live subscriptions across all connections.
#[derive(Clone, Default)]
pub struct Registry {
    conns: Arc<DashMap<u64, ConnEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection's outbound queue. Called once on accept.
    pub fn attach(&self, conn_id: u64, sender: mpsc::Sender<String>, kick: Arc<Notify>) {
        self.conns.insert(
            conn_id,
            ConnEntry {
                sender,
                kick,
                subs: Mutex::new(HashMap::new()),
            },
        );
    }

    /// Remove a connection and every subscription it held. Called on
    /// teardown, unconditionally.
    pub fn detach(&self, conn_id: u64) {
        self.conns.remove(&conn_id);
    }

    /// Install (or atomically replace) a subscription. A broadcast pass
    /// sees either the old filter set or the new one, never a mix.
    pub fn register(&self, conn_id: u64, sub_id: &str, filters: Vec<Filter>) {
        if let Some(entry) = self.conns.get(&conn_id) {
            entry.subs.lock().insert(sub_id.to_string(), filters);
        }
    }

    /// Drop one subscription. Broadcasts already queued are not recalled.
    pub fn unregister(&self, conn_id: u64, sub_id: &str) {
        if let Some(entry) = self.conns.get(&conn_id) {
            entry.subs.lock().remove(sub_id);
        }
    }

    /// Number of live connections, used by the info document.
    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    /// Evaluate a freshly committed event against every live subscription
    /// and enqueue `EVENT` frames for the matches. Returns the number of
    /// deliveries queued.
    ///
    /// This path never reads storage; the event in hand is the one the
    /// store just committed. A full outbound queue kicks that consumer.
    pub fn broadcast(&self, ev: &Event) -> usize {
        if ev.expired_at().is_some_and(|t| t <= unix_now()) {
            return 0;
        }
        let mut delivered = 0;
        let mut kicked = vec![];
        for entry in self.conns.iter() {
            let conn_id = *entry.key();
            let matches: Vec<String> = {
                let subs = entry.subs.lock();
                subs.iter()
                    .filter(|(_, filters)| filters.iter().any(|f| f.matches(ev)))
                    .map(|(sub_id, _)| sub_id.clone())
                    .collect()
            };
            for sub_id in matches {
                let frame = json!(["EVENT", sub_id, ev]).to_string();
                match entry.sender.try_send(frame) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(conn_id, "outbound queue full, disconnecting slow consumer");
                        entry.kick.notify_one();
                        kicked.push(conn_id);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        kicked.push(conn_id);
                        break;
                    }
                }
            }
        }
        for conn_id in kicked {
            self.conns.remove(&conn_id);
        }
        trace!(event = %ev.id, delivered, "broadcast complete");
        delivered
    }
}
