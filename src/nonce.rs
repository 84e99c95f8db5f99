//! Time-windowed keyed tokens authenticating follow-up calls.
//!
//! Time is cut into ticks of half the configured lifetime. A token minted in
//! tick `i` verifies during ticks `i` and `i + 1`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::error;

type HmacSha256 = Hmac<Sha256>;

/// Action bound into every follow-up token.
pub const UPLOAD_ACTION: &str = "sheets_bridge_upload";

#[derive(Clone)]
pub struct NonceSigner {
    secret: Vec<u8>,
    action: String,
    tick_secs: i64,
}

/// Which window a token verified in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceAge {
    Current,
    Previous,
}

impl NonceSigner {
    pub fn new(secret: impl AsRef<[u8]>, action: impl Into<String>, lifetime_secs: u64) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            action: action.into(),
            tick_secs: ((lifetime_secs / 2).max(1)) as i64,
        }
    }

    pub fn tick(&self, now: DateTime<Utc>) -> i64 {
        let ts = now.timestamp();
        // ceil for positive timestamps
        (ts + self.tick_secs - 1).div_euclid(self.tick_secs)
    }

    /// 10 hex chars taken from the tail of the MAC.
    pub fn compute(&self, tick: i64) -> String {
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            // HMAC accepts keys of any length.
            Err(_) => return String::new(),
        };
        mac.update(format!("{tick}{}", self.action).as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        let len = digest.len();
        digest[len - 12..len - 2].to_string()
    }

    pub fn create(&self) -> String {
        self.create_at(Utc::now())
    }

    pub fn create_at(&self, now: DateTime<Utc>) -> String {
        self.compute(self.tick(now))
    }

    pub fn verify(&self, nonce: &str) -> Option<NonceAge> {
        self.verify_at(nonce, Utc::now())
    }

    pub fn verify_at(&self, nonce: &str, now: DateTime<Utc>) -> Option<NonceAge> {
        self.verify_tick(nonce, self.tick(now))
    }

    /// Accept tokens computed for `tick` or `tick - 1`.
    pub fn verify_tick(&self, nonce: &str, tick: i64) -> Option<NonceAge> {
        if nonce.is_empty() {
            error!(action = %self.action, "Unable to verify nonce: empty");
            return None;
        }
        if constant_time_eq(nonce.as_bytes(), self.compute(tick).as_bytes()) {
            return Some(NonceAge::Current);
        }
        if constant_time_eq(nonce.as_bytes(), self.compute(tick - 1).as_bytes()) {
            return Some(NonceAge::Previous);
        }
        error!(action = %self.action, "Unable to verify nonce");
        None
    }
}

impl std::fmt::Debug for NonceSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceSigner")
            .field("action", &self.action)
            .field("tick_secs", &self.tick_secs)
            .finish_non_exhaustive()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
