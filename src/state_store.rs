use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// One-shot, key-expiring store for short-lived correlation state (payment
/// return tokens). The interface is the capability: swapping the dashmap for
/// an external shared store only touches this module.
#[derive(Default)]
pub struct TtlStore {
    entries: DashMap<String, Entry>,
}

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl TtlStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>, ttl_secs: i64) {
        self.entries.insert(
            key.into(),
            Entry {
                value: value.into(),
                expires_at: Utc::now() + Duration::seconds(ttl_secs),
            },
        );
    }

    /// Removes and returns the value. A second call for the same key, or a
    /// call after expiry, returns `None`.
    pub fn take_once(&self, key: &str) -> Option<String> {
        let (_, entry) = self.entries.remove(key)?;
        if entry.expires_at < Utc::now() {
            return None;
        }
        Some(entry.value)
    }

    /// Drops expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at >= now);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_once_consumes_the_key() {
        let store = TtlStore::new();
        store.put("token", "payment-1", 60);
        assert_eq!(store.take_once("token").as_deref(), Some("payment-1"));
        assert_eq!(store.take_once("token"), None);
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let store = TtlStore::new();
        store.put("stale", "value", -1);
        assert_eq!(store.take_once("stale"), None);
    }

    #[test]
    fn purge_removes_only_expired_entries() {
        let store = TtlStore::new();
        store.put("stale", "a", -1);
        store.put("fresh", "b", 60);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.take_once("fresh").as_deref(), Some("b"));
    }
}
