//! Per-key in-flight guards for optimistic actions.
//!
//! Each acquisition takes a token from a monotonically increasing counter.
//! Releasing a guard only clears its slot while the slot still holds that
//! token, so a stale completion can never clear the guard of a newer call.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;

use crate::{FeedError, PostId};

/// Logical key of an action that may have at most one call in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InFlightKey {
    /// Vote on a post.
    Vote(PostId),
    /// Comment submission on a post.
    Comment(PostId),
    /// Image upload (one per client).
    Upload,
}

impl fmt::Display for InFlightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InFlightKey::Vote(id) => write!(f, "vote on post {}", id),
            InFlightKey::Comment(id) => write!(f, "comment on post {}", id),
            InFlightKey::Upload => f.write_str("upload"),
        }
    }
}

/// Registry of in-flight actions.
#[derive(Debug, Default)]
pub struct InFlight {
    slots: DashMap<InFlightKey, u64>,
    next_token: AtomicU64,
}

impl InFlight {
    /// Create a new empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark `key` in flight.
    ///
    /// Fails with [`FeedError::InFlightConflict`] if it already is; repeats
    /// are dropped, not queued.
    pub fn try_acquire(self: &Arc<Self>, key: InFlightKey) -> Result<InFlightGuard, FeedError> {
        match self.slots.entry(key) {
            Entry::Occupied(_) => Err(FeedError::InFlightConflict { key }),
            Entry::Vacant(entry) => {
                let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
                entry.insert(token);
                trace!(%key, token, "in-flight acquired");
                Ok(InFlightGuard {
                    registry: Arc::clone(self),
                    key,
                    token,
                })
            }
        }
    }

    /// Whether `key` currently has a call in flight.
    pub fn is_in_flight(&self, key: InFlightKey) -> bool {
        self.slots.contains_key(&key)
    }

    /// Number of keys currently in flight.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn release(&self, key: InFlightKey, token: u64) {
        let removed = self.slots.remove_if(&key, |_, current| *current == token);
        if removed.is_some() {
            trace!(%key, token, "in-flight released");
        } else {
            trace!(%key, token, "stale in-flight release ignored");
        }
    }
}

/// Scoped in-flight marker; dropping it releases the key.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<InFlight>,
    key: InFlightKey,
    token: u64,
}

impl InFlightGuard {
    /// The guarded key.
    pub fn key(&self) -> InFlightKey {
        self.key
    }

    /// Token assigned to this acquisition.
    pub fn token(&self) -> u64 {
        self.token
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.release(self.key, self.token);
    }
}
