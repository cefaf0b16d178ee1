//! Nostr event model: canonical serialization, content addressing, and the
//! structural rules every inbound payload must satisfy before any
//! cryptography runs.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Upper bound on serialized content length accepted by the relay.
pub const MAX_CONTENT_LEN: usize = 128 * 1024;
/// Upper bound on the number of tag arrays per event.
pub const MAX_TAGS: usize = 2500;
/// Upper bound on a single tag element.
pub const MAX_TAG_ELEMENT_LEN: usize = 1024;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the name and
/// the following elements hold data. Common examples include:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `d` – identifier for parameterized replaceable events
/// - `t` – free-form topic or hashtag
/// - `expiration` – unix timestamp after which the event is dead
///
/// Each tag is stored verbatim so uncommon or custom tags survive a
/// round-trip through the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

/// Core Nostr event persisted in the store and served to clients.
///
/// ```json
/// {
///   "id": "aa11...",
///   "pubkey": "8f9a...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["t", "news"], ["d", "slug"]],
///   "content": "hello",
///   "sig": "deadbeef..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier: hex SHA-256 of the canonical serialization.
    pub id: String,
    /// Author x-only public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Ordered tags such as `d` (identifier) or `t` (topic).
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash (hex).
    pub sig: String,
}

/// Structural rejection of an event payload, carrying the offending field
/// path so clients can see exactly what was malformed.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaError {
    /// Path of the field that failed, e.g. `sig` or `tags[3]`.
    pub field: String,
    /// Human-readable reason.
    pub reason: String,
}

impl SchemaError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

impl std::error::Error for SchemaError {}

impl Event {
    /// Check field lengths, hex alphabets, and tag shape.
    ///
    /// This is the first admission step and runs before any hashing or
    /// signature work, so malformed payloads are cheap to reject.
    pub fn check_structure(&self) -> Result<(), SchemaError> {
        check_hex(&self.id, 64, "id")?;
        check_hex(&self.pubkey, 64, "pubkey")?;
        check_hex(&self.sig, 128, "sig")?;
        if self.content.len() > MAX_CONTENT_LEN {
            return Err(SchemaError::new("content", "exceeds maximum length"));
        }
        if self.tags.len() > MAX_TAGS {
            return Err(SchemaError::new("tags", "too many tags"));
        }
        for (i, Tag(fields)) in self.tags.iter().enumerate() {
            if fields.is_empty() {
                return Err(SchemaError::new(format!("tags[{i}]"), "empty tag"));
            }
            for (j, field) in fields.iter().enumerate() {
                if field.len() > MAX_TAG_ELEMENT_LEN {
                    return Err(SchemaError::new(
                        format!("tags[{i}][{j}]"),
                        "tag element too long",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Recompute the content hash from the canonical serialization
    /// `[0, pubkey, created_at, kind, tags, content]`.
    pub fn hash(&self) -> [u8; 32] {
        let arr = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        // Canonical form is the compact JSON encoding of the array.
        let data = serde_json::to_vec(&arr).expect("event fields serialize");
        Sha256::digest(&data).into()
    }

    /// True for kinds where only one event per `(pubkey, kind)` survives.
    pub fn is_replaceable(&self) -> bool {
        matches!(self.kind, 0 | 3) || (10000..20000).contains(&self.kind)
    }

    /// True for kinds where one event per `(pubkey, kind, d_tag)` survives.
    pub fn is_param_replaceable(&self) -> bool {
        (30000..40000).contains(&self.kind)
    }

    /// Value of the first `d` tag for parameterized replaceable kinds.
    ///
    /// Returns the empty string when such a kind carries no `d` tag and
    /// `None` for every other kind.
    pub fn d_value(&self) -> Option<String> {
        if !self.is_param_replaceable() {
            return None;
        }
        let d = self.tags.iter().find_map(|Tag(fields)| {
            match fields.as_slice() {
                [name, value, ..] if name == "d" => Some(value.clone()),
                _ => None,
            }
        });
        Some(d.unwrap_or_default())
    }

    /// Unix timestamp from the first `expiration` tag, if present and
    /// parseable.
    pub fn expired_at(&self) -> Option<u64> {
        self.tags.iter().find_map(|Tag(fields)| match fields.as_slice() {
            [name, value, ..] if name == "expiration" => value.trim().parse().ok(),
            _ => None,
        })
    }

    /// `"name:value"` keys for every tag whose name is a single lowercase
    /// letter or digit. Duplicates within the event collapse, order of first
    /// appearance is kept.
    pub fn generic_tags(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = vec![];
        for Tag(fields) in &self.tags {
            if let [name, value, ..] = fields.as_slice() {
                if is_generic_tag_name(name) {
                    let key = format!("{name}:{value}");
                    if seen.insert(key.clone()) {
                        out.push(key);
                    }
                }
            }
        }
        out
    }

    /// Count of leading zero bits in the event id, the proof-of-work
    /// difficulty actually attained.
    pub fn pow_bits(&self) -> u32 {
        let mut bits = 0;
        for pair in self.id.as_bytes().chunks(2) {
            let byte = match std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
            {
                Some(b) => b,
                None => return bits,
            };
            if byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros();
                break;
            }
        }
        bits
    }
}

/// True when `name` qualifies for the generic-tag index: exactly one
/// lowercase ASCII letter or digit.
pub fn is_generic_tag_name(name: &str) -> bool {
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => c.is_ascii_lowercase() || c.is_ascii_digit(),
        _ => false,
    }
}

/// True when `s` consists solely of lowercase hex digits.
pub fn is_lower_hex(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn check_hex(value: &str, len: usize, field: &str) -> Result<(), SchemaError> {
    if value.len() != len {
        return Err(SchemaError::new(
            field,
            format!("expected {len} hex characters"),
        ));
    }
    if !is_lower_hex(value) {
        return Err(SchemaError::new(field, "not lowercase hex"));
    }
    Ok(())
}
