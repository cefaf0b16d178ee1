//! Subscription filters: explicit parsing from wire JSON and live matching
//! against admitted events.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::event::{is_lower_hex, Event};

/// Declarative query over event fields, used both for historical replay and
/// for live subscription matching.
///
/// All present fields AND together; values within one field OR. `limit`
/// only affects historical replay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Event id prefixes (lowercase hex, up to 64 chars).
    pub ids: Option<Vec<String>>,
    /// Author pubkey prefixes (lowercase hex, up to 64 chars).
    pub authors: Option<Vec<String>>,
    /// Kind numbers.
    pub kinds: Option<Vec<u32>>,
    /// Generic tag constraints keyed by tag name, e.g. `t -> ["nostr"]`
    /// from a `#t` filter field.
    pub tags: BTreeMap<String, Vec<String>>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<u64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<u64>,
    /// Maximum number of historical events to replay.
    pub limit: Option<usize>,
}

/// Rejected filter payload with the offending field path.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{field}: {reason}")]
pub struct FilterError {
    /// Path of the field that failed, e.g. `authors[1]`.
    pub field: String,
    /// Human-readable reason.
    pub reason: String,
}

impl FilterError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl Filter {
    /// Parse a filter from its wire JSON object.
    ///
    /// Unknown fields are ignored so newer clients keep working; known
    /// fields with the wrong shape are an error rather than silently
    /// dropped constraints.
    pub fn from_value(val: &Value) -> Result<Self, FilterError> {
        let obj = val
            .as_object()
            .ok_or_else(|| FilterError::new("filter", "not a JSON object"))?;
        let mut filter = Filter::default();
        for (key, value) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(hex_prefixes(value, "ids")?),
                "authors" => filter.authors = Some(hex_prefixes(value, "authors")?),
                "kinds" => {
                    let arr = expect_array(value, "kinds")?;
                    let mut kinds = Vec::with_capacity(arr.len());
                    for (i, item) in arr.iter().enumerate() {
                        let kind = item
                            .as_u64()
                            .and_then(|k| u32::try_from(k).ok())
                            .ok_or_else(|| {
                                FilterError::new(format!("kinds[{i}]"), "not a kind number")
                            })?;
                        kinds.push(kind);
                    }
                    filter.kinds = Some(kinds);
                }
                "since" => filter.since = Some(expect_u64(value, "since")?),
                "until" => filter.until = Some(expect_u64(value, "until")?),
                "limit" => filter.limit = Some(expect_u64(value, "limit")? as usize),
                tag_key if tag_key.starts_with('#') => {
                    let name = &tag_key[1..];
                    if name.is_empty() {
                        return Err(FilterError::new(tag_key, "empty tag name"));
                    }
                    let arr = expect_array(value, tag_key)?;
                    let mut values = Vec::with_capacity(arr.len());
                    for (i, item) in arr.iter().enumerate() {
                        let v = item.as_str().ok_or_else(|| {
                            FilterError::new(format!("{tag_key}[{i}]"), "not a string")
                        })?;
                        values.push(v.to_string());
                    }
                    filter.tags.insert(name.to_string(), values);
                }
                // Fields like "search" belong to extensions this relay does
                // not serve; they are not constraints here.
                _ => {}
            }
        }
        Ok(filter)
    }

    /// Evaluate the filter against a single event.
    ///
    /// This is the live-broadcast path: every present field must pass, and
    /// `limit` is ignored.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|p| ev.id.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|p| ev.pubkey.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        if !self.tags.is_empty() {
            let event_tags = ev.generic_tags();
            for (name, values) in &self.tags {
                let hit = values
                    .iter()
                    .any(|v| event_tags.iter().any(|key| key == &format!("{name}:{v}")));
                if !hit {
                    return false;
                }
            }
        }
        true
    }
}

fn expect_array<'a>(value: &'a Value, field: &str) -> Result<&'a Vec<Value>, FilterError> {
    value
        .as_array()
        .ok_or_else(|| FilterError::new(field, "not an array"))
}

fn expect_u64(value: &Value, field: &str) -> Result<u64, FilterError> {
    value
        .as_u64()
        .ok_or_else(|| FilterError::new(field, "not an unsigned integer"))
}

/// Parse an array of lowercase-hex prefixes, used for `ids` and `authors`.
fn hex_prefixes(value: &Value, field: &str) -> Result<Vec<String>, FilterError> {
    let arr = expect_array(value, field)?;
    let mut out = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        let s = item
            .as_str()
            .ok_or_else(|| FilterError::new(format!("{field}[{i}]"), "not a string"))?;
        if s.is_empty() || s.len() > 64 || !is_lower_hex(s) {
            return Err(FilterError::new(
                format!("{field}[{i}]"),
                "not a lowercase hex prefix",
            ));
        }
        out.push(s.to_string());
    }
    Ok(out)
}
