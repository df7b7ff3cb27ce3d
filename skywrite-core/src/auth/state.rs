//! In-flight authorization state.
//!
//! Bounded, process-local map from the opaque `state` parameter to the PKCE
//! verifier and redirect URI it was issued with. Entries are single-use and
//! expire after ten minutes; the dispatcher's maintenance task drives the
//! sweep.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::error::{Error, Result};

const STATE_TTL_MINUTES: i64 = 10;
const DEFAULT_CAPACITY: usize = 10_000;

/// What we remember between issuing an authorization URL and the callback.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub verifier: String,
    pub redirect_uri: String,
    pub expires_at: DateTime<Utc>,
}

/// Bounded TTL map for pending authorizations.
#[derive(Debug)]
pub struct AuthStateStore {
    entries: DashMap<String, PendingAuthorization>,
    capacity: usize,
}

impl Default for AuthStateStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl AuthStateStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    /// Store a pending authorization under its state parameter.
    pub fn insert(&self, state: String, verifier: String, redirect_uri: String) -> Result<()> {
        if self.entries.len() >= self.capacity {
            self.sweep_expired();
            if self.entries.len() >= self.capacity {
                return Err(Error::RateLimited {
                    retry_after: std::time::Duration::from_secs(60),
                });
            }
        }
        self.entries.insert(
            state,
            PendingAuthorization {
                verifier,
                redirect_uri,
                expires_at: Utc::now() + Duration::minutes(STATE_TTL_MINUTES),
            },
        );
        Ok(())
    }

    /// Consume a state entry. Single-use: the entry is removed whether or
    /// not it is still fresh; an expired entry yields `None`.
    pub fn take(&self, state: &str) -> Option<PendingAuthorization> {
        let (_, entry) = self.entries.remove(state)?;
        if entry.expires_at <= Utc::now() {
            return None;
        }
        Some(entry)
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_single_use() {
        let store = AuthStateStore::default();
        store
            .insert("st".into(), "ver".into(), "https://app/callback".into())
            .unwrap();
        let taken = store.take("st").unwrap();
        assert_eq!(taken.verifier, "ver");
        assert!(store.take("st").is_none());
    }

    #[test]
    fn expired_state_is_not_returned() {
        let store = AuthStateStore::default();
        store
            .insert("st".into(), "ver".into(), "https://app/callback".into())
            .unwrap();
        store
            .entries
            .get_mut("st")
            .unwrap()
            .expires_at = Utc::now() - Duration::seconds(1);
        assert!(store.take("st").is_none());
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let store = AuthStateStore::default();
        store.insert("a".into(), "v".into(), "r".into()).unwrap();
        store.insert("b".into(), "v".into(), "r".into()).unwrap();
        store.entries.get_mut("a").unwrap().expires_at = Utc::now() - Duration::seconds(1);
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.take("b").is_some());
    }

    #[test]
    fn capacity_is_enforced_after_sweep() {
        let store = AuthStateStore::with_capacity(2);
        store.insert("a".into(), "v".into(), "r".into()).unwrap();
        store.insert("b".into(), "v".into(), "r".into()).unwrap();
        assert!(store.insert("c".into(), "v".into(), "r".into()).is_err());

        // Room opens up once an entry expires.
        store.entries.get_mut("a").unwrap().expires_at = Utc::now() - Duration::seconds(1);
        assert!(store.insert("c".into(), "v".into(), "r".into()).is_ok());
    }
}
