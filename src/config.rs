//! Configuration loading from `.env` files.

use std::{collections::HashSet, env, path::PathBuf};

use anyhow::{Context, Result};
use url::Url;

use crate::validate::{Policy, RateQuota, StaticTrust, TrustOracle};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the SQLite database file.
    pub db_path: PathBuf,
    /// HTTP bind address, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// WebSocket bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
    /// Server-enforced cap on query results.
    pub max_limit: usize,
    /// Required proof-of-work bits on published events; 0 disables.
    pub min_pow: u32,
    /// Require a completed AUTH exchange before accepting EVENT.
    pub auth_required: bool,
    /// Pubkeys that may never publish.
    pub restricted_pubkeys: Vec<String>,
    /// Web-of-trust allowlist; empty disables the gate.
    pub trusted_pubkeys: Vec<String>,
    /// Events allowed per rate-limit window; 0 disables.
    pub rate_limit_events: u32,
    /// Rate-limit window in seconds.
    pub rate_limit_window: u64,
    /// Seconds between expiration sweeps.
    pub sweep_interval: u64,
    /// Optional search-index endpoint; absence disables the mirror.
    pub search_index_url: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let db_path = PathBuf::from(env::var("DB_PATH")?);
        let bind_http = env::var("BIND_HTTP")?;
        let bind_ws = env::var("BIND_WS")?;
        let max_limit = parse_or("MAX_LIMIT", crate::storage::DEFAULT_MAX_LIMIT);
        let min_pow = parse_or("MIN_POW", 0);
        let auth_required = env::var("AUTH_REQUIRED").unwrap_or_else(|_| "0".into()) == "1";
        let restricted_pubkeys = csv_strings(env::var("RESTRICTED_PUBKEYS").unwrap_or_default());
        let trusted_pubkeys = csv_strings(env::var("TRUSTED_PUBKEYS").unwrap_or_default());
        let rate_limit_events = parse_or("RATE_LIMIT_EVENTS", 0);
        let rate_limit_window = parse_or("RATE_LIMIT_WINDOW", 60);
        let sweep_interval = parse_or("SWEEP_INTERVAL", 600);
        let search_index_url = match env::var("SEARCH_INDEX_URL").ok().filter(|s| !s.is_empty()) {
            Some(raw) => {
                Url::parse(&raw).context("SEARCH_INDEX_URL is not a valid URL")?;
                Some(raw)
            }
            None => None,
        };
        Ok(Self {
            db_path,
            bind_http,
            bind_ws,
            max_limit,
            min_pow,
            auth_required,
            restricted_pubkeys,
            trusted_pubkeys,
            rate_limit_events,
            rate_limit_window,
            sweep_interval,
            search_index_url,
        })
    }

    /// Admission policy derived from these settings.
    pub fn policy(&self) -> Policy {
        Policy {
            min_pow: self.min_pow,
            auth_required: self.auth_required,
            restricted_pubkeys: self.restricted_pubkeys.iter().cloned().collect(),
            rate_limit: (self.rate_limit_events > 0).then_some(RateQuota {
                events: self.rate_limit_events,
                window: self.rate_limit_window.max(1),
            }),
        }
    }

    /// Trust oracle derived from the allowlist, if one is configured.
    pub fn trust_oracle(&self) -> Option<Box<dyn TrustOracle>> {
        if self.trusted_pubkeys.is_empty() {
            return None;
        }
        let allowed: HashSet<String> = self.trusted_pubkeys.iter().cloned().collect();
        Some(Box::new(StaticTrust::new(allowed)))
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

/// Serializes tests that touch process environment variables; dotenvy
/// loads into the process-wide environment.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
