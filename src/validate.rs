//! Event admission: structural, cryptographic, and policy gating.
//!
//! Validation never touches storage; its only output is `Ok` or a
//! [`Rejection`] that maps one-to-one onto the `OK` wire message.

use std::collections::HashSet;

use dashmap::DashMap;
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use thiserror::Error;

use crate::{event::Event, storage::unix_now};

/// Kind number reserved for AUTH challenge responses.
pub const AUTH_KIND: u32 = 22242;
/// Accepted clock skew on AUTH events, seconds either way.
const AUTH_WINDOW: u64 = 600;

/// Closed set of client-facing rejection categories. The `Display` form is
/// exactly the `OK` message body, `"<category>: <detail>"`, so clients can
/// branch on the prefix.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    /// Structural, id, or signature failure.
    #[error("invalid: {0}")]
    Invalid(String),
    /// Insufficient proof-of-work difficulty.
    #[error("pow: {0}")]
    Pow(String),
    /// Publisher is not allowed here (blocklist, missing auth, or outside
    /// the web of trust).
    #[error("restricted: {0}")]
    Restricted(String),
    /// Publisher exceeded the event budget.
    #[error("rate-limited: {0}")]
    RateLimited(String),
    /// Internal failure surfaced after retries.
    #[error("error: {0}")]
    Error(String),
}

/// Per-message client context, passed positionally into handlers.
#[derive(Debug, Clone, Default)]
pub struct ClientCtx {
    /// Relay-local connection identifier.
    pub conn_id: u64,
    /// Remote address of the publishing socket.
    pub remote: String,
    /// Pubkey recorded by a completed AUTH exchange, if any.
    pub authed_pubkey: Option<String>,
}

/// External web-of-trust oracle, consumed as a plain yes/no answer.
pub trait TrustOracle: Send + Sync {
    /// Whether events from `pubkey` may be published here.
    fn is_trusted(&self, pubkey: &str) -> bool;
}

/// Trust oracle backed by a fixed allowlist, the materialized answer of an
/// external score computation.
pub struct StaticTrust {
    allowed: HashSet<String>,
}

impl StaticTrust {
    pub fn new(allowed: HashSet<String>) -> Self {
        Self { allowed }
    }
}

impl TrustOracle for StaticTrust {
    fn is_trusted(&self, pubkey: &str) -> bool {
        self.allowed.contains(pubkey)
    }
}

/// Publishing budget: at most `events` admissions per `window` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateQuota {
    pub events: u32,
    pub window: u64,
}

/// Policy knobs consumed by the validator. Configuration of these values
/// lives outside the core; the validator only applies the decisions.
#[derive(Default)]
pub struct Policy {
    /// Required leading zero bits on event ids; 0 disables the check.
    pub min_pow: u32,
    /// Reject publishes from connections without a completed AUTH.
    pub auth_required: bool,
    /// Pubkeys that may never publish.
    pub restricted_pubkeys: HashSet<String>,
    /// Optional publishing budget per pubkey and per remote address.
    pub rate_limit: Option<RateQuota>,
}

/// Admission gate applied to every inbound event before persistence.
pub struct Validator {
    policy: Policy,
    trust: Option<Box<dyn TrustOracle>>,
    limiter: RateLimiter,
}

impl Validator {
    pub fn new(policy: Policy, trust: Option<Box<dyn TrustOracle>>) -> Self {
        Self {
            policy,
            trust,
            limiter: RateLimiter::default(),
        }
    }

    /// Run the full admission sequence, short-circuiting on the first
    /// failure. The order is fixed: structure, id, signature, proof of
    /// work, then the policy gates.
    pub fn admit(&self, ev: &Event, ctx: &ClientCtx) -> Result<(), Rejection> {
        ev.check_structure()
            .map_err(|e| Rejection::Invalid(e.to_string()))?;
        verify_event(ev)?;
        if self.policy.min_pow > 0 {
            let bits = ev.pow_bits();
            if bits < self.policy.min_pow {
                return Err(Rejection::Pow(format!(
                    "difficulty {bits} is below the required {}",
                    self.policy.min_pow
                )));
            }
        }
        if self.policy.restricted_pubkeys.contains(&ev.pubkey) {
            return Err(Rejection::Restricted(
                "this pubkey is not allowed to publish".into(),
            ));
        }
        if self.policy.auth_required && ctx.authed_pubkey.is_none() {
            return Err(Rejection::Restricted(
                "authentication required to publish".into(),
            ));
        }
        if let Some(quota) = self.policy.rate_limit {
            if !self.limiter.allow(&ev.pubkey, &ctx.remote, quota) {
                return Err(Rejection::RateLimited("slow down".into()));
            }
        }
        if let Some(trust) = &self.trust {
            if !trust.is_trusted(&ev.pubkey) {
                return Err(Rejection::Restricted(
                    "pubkey is outside this relay's web of trust".into(),
                ));
            }
        }
        Ok(())
    }

    /// Validate a signed AUTH response against the connection's one-time
    /// challenge and return the authenticated pubkey.
    pub fn verify_auth(&self, ev: &Event, challenge: &str) -> Result<String, Rejection> {
        ev.check_structure()
            .map_err(|e| Rejection::Invalid(e.to_string()))?;
        verify_event(ev)?;
        if ev.kind != AUTH_KIND {
            return Err(Rejection::Invalid(format!(
                "auth event must be kind {AUTH_KIND}"
            )));
        }
        let sent = ev.tags.iter().find_map(|t| match t.0.as_slice() {
            [name, value, ..] if name == "challenge" => Some(value.as_str()),
            _ => None,
        });
        if sent != Some(challenge) {
            return Err(Rejection::Invalid("challenge does not match".into()));
        }
        let now = unix_now();
        if ev.created_at.abs_diff(now) > AUTH_WINDOW {
            return Err(Rejection::Invalid("auth event is too old".into()));
        }
        Ok(ev.pubkey.clone())
    }
}

/// Verify that the id is the canonical hash of the event and that the
/// signature covers it.
pub fn verify_event(ev: &Event) -> Result<(), Rejection> {
    let hash = ev.hash();
    if hex::encode(hash) != ev.id {
        return Err(Rejection::Invalid(
            "id does not match the canonical serialization".into(),
        ));
    }
    let sig_bytes = hex::decode(&ev.sig)
        .map_err(|_| Rejection::Invalid("sig is not valid hex".into()))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|_| Rejection::Invalid("malformed signature".into()))?;
    let pk_bytes = hex::decode(&ev.pubkey)
        .map_err(|_| Rejection::Invalid("pubkey is not valid hex".into()))?;
    let pk = XOnlyPublicKey::from_slice(&pk_bytes)
        .map_err(|_| Rejection::Invalid("malformed pubkey".into()))?;
    let msg = Message::from_digest_slice(&hash)
        .map_err(|_| Rejection::Invalid("malformed digest".into()))?;
    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&sig, &msg, &pk)
        .map_err(|_| Rejection::Invalid("signature does not verify".into()))
}

/// Sliding-window counters shared across all connections. Entries are
/// keyed per pubkey and per remote address; either budget running out
/// denies the publish.
#[derive(Default)]
struct RateLimiter {
    windows: DashMap<String, (u64, u32)>,
}

impl RateLimiter {
    fn allow(&self, pubkey: &str, remote: &str, quota: RateQuota) -> bool {
        let now = unix_now();
        let mut ok = true;
        for key in [format!("pk:{pubkey}"), format!("ip:{remote}")] {
            let mut entry = self.windows.entry(key).or_insert((now, 0));
            if now.saturating_sub(entry.0) >= quota.window {
                *entry = (now, 0);
            }
            entry.1 += 1;
            if entry.1 > quota.events {
                ok = false;
            }
        }
        ok
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::event::Tag;
    use secp256k1::Keypair;

    /// Build a correctly signed event from a fixed secret key.
    pub(crate) fn signed_event(kind: u32, created_at: u64, tags: Vec<Tag>, content: &str) -> Event {
        let secp = Secp256k1::new();
        let kp = Keypair::from_seckey_slice(&secp, &[1u8; 32]).unwrap();
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(kp.x_only_public_key().0.serialize()),
            kind,
            created_at,
            tags,
            content: content.into(),
            sig: String::new(),
        };
        let hash = ev.hash();
        ev.id = hex::encode(hash);
        let msg = Message::from_digest_slice(&hash).unwrap();
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
        ev.sig = hex::encode(sig.as_ref());
        ev
    }

    fn open_validator() -> Validator {
        Validator::new(Policy::default(), None)
    }

    fn ctx() -> ClientCtx {
        ClientCtx {
            conn_id: 1,
            remote: "127.0.0.1".into(),
            authed_pubkey: None,
        }
    }

    #[test]
    fn valid_event_is_admitted() {
        let ev = signed_event(1, 100, vec![], "hello");
        assert_eq!(open_validator().admit(&ev, &ctx()), Ok(()));
    }

    #[test]
    fn tampered_content_is_invalid() {
        let mut ev = signed_event(1, 100, vec![], "hello");
        ev.content = "tampered".into();
        let err = open_validator().admit(&ev, &ctx()).unwrap_err();
        assert!(err.to_string().starts_with("invalid: "), "{err}");
    }

    #[test]
    fn corrupted_sig_is_invalid() {
        let mut ev = signed_event(1, 100, vec![], "hello");
        ev.sig = "00".repeat(64);
        let err = open_validator().admit(&ev, &ctx()).unwrap_err();
        assert!(err.to_string().starts_with("invalid: "), "{err}");
    }

    #[test]
    fn structural_failure_reports_field() {
        let mut ev = signed_event(1, 100, vec![], "");
        ev.pubkey = "nope".into();
        let err = open_validator().admit(&ev, &ctx()).unwrap_err();
        assert_eq!(err, Rejection::Invalid("pubkey: expected 64 hex characters".into()));
    }

    #[test]
    fn pow_gate_uses_leading_zero_bits() {
        let ev = signed_event(1, 100, vec![], "");
        let validator = Validator::new(
            Policy {
                // Unreachable without an all-zero id, so any honest event
                // trips the gate.
                min_pow: 256,
                ..Default::default()
            },
            None,
        );
        let err = validator.admit(&ev, &ctx()).unwrap_err();
        assert!(err.to_string().starts_with("pow: "), "{err}");
    }

    #[test]
    fn restricted_pubkey_is_refused() {
        let ev = signed_event(1, 100, vec![], "");
        let validator = Validator::new(
            Policy {
                restricted_pubkeys: HashSet::from([ev.pubkey.clone()]),
                ..Default::default()
            },
            None,
        );
        let err = validator.admit(&ev, &ctx()).unwrap_err();
        assert!(err.to_string().starts_with("restricted: "), "{err}");
    }

    #[test]
    fn auth_requirement_gates_unauthenticated_publish() {
        let ev = signed_event(1, 100, vec![], "");
        let validator = Validator::new(
            Policy {
                auth_required: true,
                ..Default::default()
            },
            None,
        );
        let err = validator.admit(&ev, &ctx()).unwrap_err();
        assert!(err.to_string().starts_with("restricted: "), "{err}");

        let mut authed = ctx();
        authed.authed_pubkey = Some(ev.pubkey.clone());
        assert_eq!(validator.admit(&ev, &authed), Ok(()));
    }

    #[test]
    fn rate_limit_counts_across_publishes() {
        let validator = Validator::new(
            Policy {
                rate_limit: Some(RateQuota {
                    events: 2,
                    window: 3600,
                }),
                ..Default::default()
            },
            None,
        );
        let c = ctx();
        for i in 0..2 {
            let ev = signed_event(1, 100 + i, vec![], "");
            assert_eq!(validator.admit(&ev, &c), Ok(()), "publish {i}");
        }
        let ev = signed_event(1, 200, vec![], "");
        let err = validator.admit(&ev, &c).unwrap_err();
        assert!(err.to_string().starts_with("rate-limited: "), "{err}");
    }

    #[test]
    fn trust_oracle_blocks_unknown_pubkeys() {
        let ev = signed_event(1, 100, vec![], "");
        let validator = Validator::new(
            Policy::default(),
            Some(Box::new(StaticTrust::new(HashSet::from([
                "f0".repeat(32)
            ])))),
        );
        let err = validator.admit(&ev, &ctx()).unwrap_err();
        assert!(err.to_string().starts_with("restricted: "), "{err}");

        let validator = Validator::new(
            Policy::default(),
            Some(Box::new(StaticTrust::new(HashSet::from([ev
                .pubkey
                .clone()])))),
        );
        assert_eq!(validator.admit(&ev, &ctx()), Ok(()));
    }

    #[test]
    fn auth_round_trip() {
        let challenge = "a1b2c3";
        let now = unix_now();
        let tags = vec![Tag(vec!["challenge".into(), challenge.into()])];
        let ev = signed_event(AUTH_KIND, now, tags, "");
        let pubkey = open_validator().verify_auth(&ev, challenge).unwrap();
        assert_eq!(pubkey, ev.pubkey);
    }

    #[test]
    fn auth_rejects_wrong_challenge_kind_and_age() {
        let v = open_validator();
        let now = unix_now();
        let tag = |c: &str| vec![Tag(vec!["challenge".into(), c.into()])];

        let ev = signed_event(AUTH_KIND, now, tag("other"), "");
        assert!(v.verify_auth(&ev, "expected").is_err());

        let ev = signed_event(1, now, tag("expected"), "");
        assert!(v.verify_auth(&ev, "expected").is_err());

        let ev = signed_event(AUTH_KIND, now - 2 * AUTH_WINDOW, tag("expected"), "");
        assert!(v.verify_auth(&ev, "expected").is_err());
    }
}
