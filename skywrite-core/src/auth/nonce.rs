//! Last server-issued DPoP nonce per (user, network host).
//!
//! Process-local and best-effort: losing an entry only costs one extra
//! round trip to reacquire a nonce.

use dashmap::DashMap;
use skywrite_model::UserId;

#[derive(Debug, Default)]
pub struct NonceCache {
    entries: DashMap<(UserId, String), String>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: UserId, host: &str) -> Option<String> {
        self.entries
            .get(&(user_id, host.to_string()))
            .map(|entry| entry.clone())
    }

    pub fn store(&self, user_id: UserId, host: &str, nonce: String) {
        self.entries.insert((user_id, host.to_string()), nonce);
    }
}
