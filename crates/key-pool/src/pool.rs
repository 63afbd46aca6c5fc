//! Round-robin key selection with lazy rate-limit expiry
//!
//! The rotation cursor and the rate-limit table live together behind one
//! `tokio::sync::Mutex`. Every read-modify-write of either happens under that
//! lock, and the lock is never held across I/O: callers select a key, drop
//! the guard, then talk to upstream.
//!
//! Penalties expire by comparison against the current instant at read time.
//! Entries are overwritten on every penalty (last write wins) and never
//! removed.

use std::collections::HashMap;
use std::time::Duration;

use common::Secret;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Penalty applied to a key after an upstream 429 when no other duration is configured.
pub const DEFAULT_PENALTY: Duration = Duration::from_secs(60);

/// A key handed out by the pool, ready to be used for one upstream call.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    /// Position in the pool; the identity used for rate-limit bookkeeping.
    pub index: usize,
    pub key: Secret<String>,
}

impl SelectedKey {
    /// Masked key tail for logs.
    pub fn hint(&self) -> String {
        self.key.hint()
    }
}

#[derive(Debug, Default)]
struct RotationState {
    /// Where the next round-robin scan starts.
    cursor: usize,
    /// Key index → instant after which the key is usable again.
    limited_until: HashMap<usize, Instant>,
}

impl RotationState {
    fn is_usable(&self, index: usize, now: Instant) -> bool {
        match self.limited_until.get(&index) {
            Some(until) => now >= *until,
            None => true,
        }
    }
}

/// Pool of interchangeable upstream API keys.
#[derive(Debug)]
pub struct KeyPool {
    keys: Vec<Secret<String>>,
    state: Mutex<RotationState>,
    penalty: Duration,
}

impl KeyPool {
    /// Create a pool over `keys` in the given order.
    ///
    /// An empty pool is allowed; every selection then reports
    /// [`Error::Unconfigured`].
    pub fn new(keys: Vec<Secret<String>>, penalty: Duration) -> Self {
        info!(
            keys = keys.len(),
            penalty_secs = penalty.as_secs(),
            "key pool initialized"
        );
        Self {
            keys,
            state: Mutex::new(RotationState::default()),
            penalty,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Penalty duration applied after a 429.
    pub fn penalty(&self) -> Duration {
        self.penalty
    }

    /// Return the next usable key, scanning at most one full cycle from the cursor.
    ///
    /// The cursor is moved just past the returned key. Scan order is strictly
    /// round-robin: a key whose penalty expired behind the cursor waits for
    /// the next cycle even if it would be free sooner than the keys ahead.
    pub async fn next_available(&self) -> Option<SelectedKey> {
        let n = self.keys.len();
        if n == 0 {
            return None;
        }

        let now = Instant::now();
        let mut state = self.state.lock().await;

        for offset in 0..n {
            let index = (state.cursor + offset) % n;
            if state.is_usable(index, now) {
                state.cursor = (index + 1) % n;
                let selected = SelectedKey {
                    index,
                    key: self.keys[index].clone(),
                };
                debug!(key_index = index, key_hint = %selected.hint(), "key selected");
                return Some(selected);
            }
        }

        debug!(keys = n, "no usable key in pool");
        None
    }

    /// Select a key, distinguishing an empty pool from a fully penalized one.
    pub async fn select(&self) -> Result<SelectedKey> {
        if self.keys.is_empty() {
            return Err(Error::Unconfigured);
        }
        self.next_available().await.ok_or(Error::Exhausted {
            total: self.keys.len(),
        })
    }

    /// Mark `key` unusable until `now + duration`.
    ///
    /// Looks up the first pool entry equal to `key`. Unknown keys are ignored.
    /// A new penalty replaces any existing one, even a longer one.
    pub async fn penalize(&self, key: &str, duration: Duration) {
        let Some(index) = self.keys.iter().position(|k| k.expose() == key) else {
            debug!("penalize called with a key not in the pool, ignoring");
            return;
        };

        let until = Instant::now() + duration;
        self.state.lock().await.limited_until.insert(index, until);
        info!(
            key_index = index,
            key_hint = %self.keys[index].hint(),
            penalty_secs = duration.as_secs(),
            "key rate limited"
        );
    }

    /// True iff every key is penalized at this instant.
    ///
    /// An empty pool is unconfigured rather than exhausted, so it reports `false`.
    pub async fn all_penalized(&self) -> bool {
        if self.keys.is_empty() {
            return false;
        }
        let now = Instant::now();
        let state = self.state.lock().await;
        (0..self.keys.len()).all(|index| !state.is_usable(index, now))
    }

    /// Per-key status snapshot for the health endpoint. Contains no key material.
    ///
    /// `healthy` when every key is usable, `degraded` when some are,
    /// `unhealthy` when none are or the pool is empty.
    pub async fn health(&self) -> serde_json::Value {
        let now = Instant::now();
        let state = self.state.lock().await;

        let mut keys = Vec::with_capacity(self.keys.len());
        let mut available = 0usize;
        let mut limited = 0usize;

        for index in 0..self.keys.len() {
            match state.limited_until.get(&index) {
                Some(until) if now < *until => {
                    limited += 1;
                    keys.push(serde_json::json!({
                        "index": index,
                        "status": "rate_limited",
                        "rate_limited_remaining_secs": (*until - now).as_secs(),
                    }));
                }
                _ => {
                    available += 1;
                    keys.push(serde_json::json!({
                        "index": index,
                        "status": "available",
                    }));
                }
            }
        }

        let total = self.keys.len();
        let status = if total > 0 && available == total {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "keys_total": total,
            "keys_available": available,
            "keys_rate_limited": limited,
            "keys": keys,
        })
    }
}
