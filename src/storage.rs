//! SQLite-backed event store and query engine.
//!
//! The store owns the `events` table and its `generic_tags` secondary
//! index, the replaceable-event overwrite semantics, and the translation of
//! filters into indexed SQL lookups. All writes for one event happen inside
//! a single transaction, so concurrent readers never observe a half-applied
//! overwrite.

use std::{
    collections::HashMap,
    path::Path,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};

use crate::{
    event::{Event, Tag},
    filter::Filter,
};

/// Hard cap applied to every historical query regardless of what the
/// client asked for.
pub const DEFAULT_MAX_LIMIT: usize = 500;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id          TEXT PRIMARY KEY,
    pubkey      TEXT    NOT NULL,
    created_at  INTEGER NOT NULL,
    kind        INTEGER NOT NULL,
    tags        TEXT    NOT NULL,
    content     TEXT    NOT NULL,
    sig         TEXT    NOT NULL,
    d_tag_value TEXT,
    expired_at  INTEGER
);
CREATE INDEX IF NOT EXISTS events_author_kind ON events (pubkey, kind, created_at DESC);
CREATE INDEX IF NOT EXISTS events_kind_created ON events (kind, created_at DESC);
CREATE INDEX IF NOT EXISTS events_created ON events (created_at DESC);
CREATE INDEX IF NOT EXISTS events_expired ON events (expired_at) WHERE expired_at IS NOT NULL;

CREATE TABLE IF NOT EXISTS generic_tags (
    event_id   TEXT    NOT NULL REFERENCES events (id) ON DELETE CASCADE,
    tag        TEXT    NOT NULL,
    author     TEXT    NOT NULL,
    kind       INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (event_id, tag)
);
CREATE INDEX IF NOT EXISTS tags_author_first ON generic_tags (author, tag, kind, created_at DESC, event_id);
CREATE INDEX IF NOT EXISTS tags_tag_first ON generic_tags (tag, kind, author, created_at DESC, event_id);
";

/// Result of a `put`, all of which are acknowledged as success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The event was inserted.
    Stored,
    /// The id was already present; nothing changed.
    Duplicate,
    /// A replaceable event lost to the incumbent and was dropped.
    Shadowed,
}

/// Persistent store for events, shared across connections.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    max_limit: usize,
}

impl Store {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>, max_limit: usize) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening database {}", path.as_ref().display()))?;
        Self::from_connection(conn, max_limit)
    }

    /// In-memory store, used by tests.
    pub fn in_memory(max_limit: usize) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, max_limit)
    }

    fn from_connection(conn: Connection, max_limit: usize) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA).context("creating schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_limit,
        })
    }

    /// Persist an event, applying replaceable-overwrite semantics.
    ///
    /// For replaceable kinds the incumbent row for the same logical key is
    /// compared by `(created_at, id)`: newer `created_at` wins, equal
    /// timestamps keep the lexicographically smaller id. The loser's row
    /// and its tag rows are removed in the same transaction.
    pub fn put(&self, ev: &Event) -> Result<PutOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if ev.is_replaceable() || ev.is_param_replaceable() {
            let d = ev.d_value();
            let existing: Option<(String, u64)> = match &d {
                Some(dv) => tx
                    .query_row(
                        "SELECT id, created_at FROM events
                         WHERE pubkey = ?1 AND kind = ?2 AND d_tag_value = ?3",
                        params![ev.pubkey, ev.kind, dv],
                        |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)),
                    )
                    .optional()?,
                None => tx
                    .query_row(
                        "SELECT id, created_at FROM events
                         WHERE pubkey = ?1 AND kind = ?2 AND d_tag_value IS NULL",
                        params![ev.pubkey, ev.kind],
                        |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)),
                    )
                    .optional()?,
            };
            if let Some((old_id, old_created)) = existing {
                if old_id == ev.id {
                    return Ok(PutOutcome::Duplicate);
                }
                let incoming_wins = ev.created_at > old_created
                    || (ev.created_at == old_created && ev.id < old_id);
                if !incoming_wins {
                    return Ok(PutOutcome::Shadowed);
                }
                tx.execute("DELETE FROM events WHERE id = ?1", params![old_id])?;
            }
        }

        let tags_json = serde_json::to_string(&ev.tags)?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO events
             (id, pubkey, created_at, kind, tags, content, sig, d_tag_value, expired_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ev.id,
                ev.pubkey,
                ev.created_at as i64,
                ev.kind,
                tags_json,
                ev.content,
                ev.sig,
                ev.d_value(),
                ev.expired_at().map(|t| t as i64),
            ],
        )?;
        if inserted == 0 {
            // Idempotent re-publish of a known id.
            return Ok(PutOutcome::Duplicate);
        }
        for key in ev.generic_tags() {
            tx.execute(
                "INSERT OR IGNORE INTO generic_tags (event_id, tag, author, kind, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ev.id, key, ev.pubkey, ev.kind, ev.created_at as i64],
            )?;
        }
        tx.commit()?;
        Ok(PutOutcome::Stored)
    }

    /// Run a set of filters against the store: per-filter indexed lookups,
    /// union by id, newest-first with id-descending tiebreak, capped.
    pub fn query(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        if filters.is_empty() {
            return Ok(vec![]);
        }
        let now = unix_now();
        let conn = self.conn.lock();
        let mut by_id: HashMap<String, Event> = HashMap::new();
        for filter in filters {
            let (clause, mut values) = filter_where(filter, now);
            let cap = filter
                .limit
                .map(|l| l.min(self.max_limit))
                .unwrap_or(self.max_limit);
            values.push(SqlValue::Integer(cap as i64));
            let sql = format!(
                "SELECT id, pubkey, created_at, kind, tags, content, sig FROM events
                 WHERE {clause}
                 ORDER BY created_at DESC, id DESC LIMIT ?"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values), row_to_event)?;
            for row in rows {
                let ev = row?;
                by_id.entry(ev.id.clone()).or_insert(ev);
            }
        }
        let mut events: Vec<Event> = by_id.into_values().collect();
        events.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        // The subscription's overall cap: the largest per-filter limit when
        // every filter carries one, the server maximum otherwise.
        let overall = if filters.iter().all(|f| f.limit.is_some()) {
            filters
                .iter()
                .filter_map(|f| f.limit)
                .max()
                .unwrap_or(0)
                .min(self.max_limit)
        } else {
            self.max_limit
        };
        events.truncate(overall);
        Ok(events)
    }

    /// Cardinality of the deduplicated union of the filters, without
    /// materializing event rows.
    pub fn count(&self, filters: &[Filter]) -> Result<u64> {
        if filters.is_empty() {
            return Ok(0);
        }
        let now = unix_now();
        let conn = self.conn.lock();
        let mut subqueries = Vec::with_capacity(filters.len());
        let mut values = vec![];
        for filter in filters {
            let (clause, params) = filter_where(filter, now);
            subqueries.push(format!("SELECT id FROM events WHERE {clause}"));
            values.extend(params);
        }
        let sql = format!("SELECT COUNT(*) FROM ({})", subqueries.join(" UNION "));
        let count: i64 = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Fetch a single event by exact id, ignoring expiration.
    pub fn get(&self, id: &str) -> Result<Option<Event>> {
        let conn = self.conn.lock();
        let ev = conn
            .query_row(
                "SELECT id, pubkey, created_at, kind, tags, content, sig FROM events
                 WHERE id = ?1",
                params![id],
                row_to_event,
            )
            .optional()?;
        Ok(ev)
    }

    /// Physically delete rows whose expiration has passed. Returns the
    /// number of events removed; their tag rows cascade.
    pub fn sweep_expired(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM events WHERE expired_at IS NOT NULL AND expired_at <= ?1",
            params![unix_now() as i64],
        )?;
        Ok(removed)
    }

    /// Re-verify id and signature for a random sample of stored events.
    pub fn verify_sample(&self, sample: usize) -> Result<usize> {
        let events: Vec<Event> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT id, pubkey, created_at, kind, tags, content, sig FROM events
                 ORDER BY RANDOM() LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![sample as i64], row_to_event)?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        let checked = events.len();
        for ev in events {
            crate::validate::verify_event(&ev)
                .with_context(|| format!("stored event {} failed verification", ev.id))?;
        }
        Ok(checked)
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let tags_json: String = row.get(4)?;
    let tags: Vec<Tag> = serde_json::from_str(&tags_json).unwrap_or_default();
    Ok(Event {
        id: row.get(0)?,
        pubkey: row.get(1)?,
        created_at: row.get::<_, i64>(2)? as u64,
        kind: row.get(3)?,
        tags,
        content: row.get(5)?,
        sig: row.get(6)?,
    })
}

/// Translate one filter into a WHERE clause over `events` plus its bound
/// parameters. Hex prefixes were validated at parse time, so LIKE patterns
/// contain no wildcards of their own.
fn filter_where(filter: &Filter, now: u64) -> (String, Vec<SqlValue>) {
    let mut clauses = vec!["(expired_at IS NULL OR expired_at > ?)".to_string()];
    let mut values = vec![SqlValue::Integer(now as i64)];

    if let Some(ids) = &filter.ids {
        clauses.push(prefix_clause("id", ids, &mut values));
    }
    if let Some(authors) = &filter.authors {
        clauses.push(prefix_clause("pubkey", authors, &mut values));
    }
    if let Some(kinds) = &filter.kinds {
        if kinds.is_empty() {
            clauses.push("0".into());
        } else {
            let marks = vec!["?"; kinds.len()].join(", ");
            clauses.push(format!("kind IN ({marks})"));
            values.extend(kinds.iter().map(|k| SqlValue::Integer(*k as i64)));
        }
    }
    for (name, tag_values) in &filter.tags {
        if tag_values.is_empty() {
            clauses.push("0".into());
            continue;
        }
        let marks = vec!["?"; tag_values.len()].join(", ");
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM generic_tags g
                     WHERE g.event_id = events.id AND g.tag IN ({marks}))"
        ));
        values.extend(
            tag_values
                .iter()
                .map(|v| SqlValue::Text(format!("{name}:{v}"))),
        );
    }
    if let Some(since) = filter.since {
        clauses.push("created_at >= ?".into());
        values.push(SqlValue::Integer(since as i64));
    }
    if let Some(until) = filter.until {
        clauses.push("created_at <= ?".into());
        values.push(SqlValue::Integer(until as i64));
    }
    (clauses.join(" AND "), values)
}

fn prefix_clause(column: &str, prefixes: &[String], values: &mut Vec<SqlValue>) -> String {
    if prefixes.is_empty() {
        return "0".into();
    }
    let parts: Vec<String> = prefixes
        .iter()
        .map(|p| {
            if p.len() == 64 {
                values.push(SqlValue::Text(p.clone()));
                format!("{column} = ?")
            } else {
                values.push(SqlValue::Text(format!("{p}%")));
                format!("{column} LIKE ?")
            }
        })
        .collect();
    format!("({})", parts.join(" OR "))
}
