/*
 * Jiralink - Teams/Jira conversational bridge
 * Copyright (C) 2025–2026 Jiralink contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! TTL cache for serialized lookups. Values are stored as JSON strings so
//! the same cache fronts user connections, dialog state and Graph tokens
//! without caring about their types.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::trace;

pub struct TtlCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl TtlCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Fetch and deserialize a fresh entry; expired entries read as misses
    /// and are dropped lazily on the next write.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.entries.read().await;
        let (raw, stored_at) = entries.get(key)?;
        if stored_at.elapsed() >= self.ttl {
            return None;
        }
        serde_json::from_str(raw).ok()
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) {
        let Ok(raw) = serde_json::to_string(value) else {
            trace!(key, "value not serializable, skipping cache");
            return;
        };
        let mut entries = self.entries.write().await;
        entries.retain(|_, (_, stored_at)| stored_at.elapsed() < self.ttl);
        entries.insert(key.to_string(), (raw, Instant::now()));
    }

    pub async fn invalidate(&self, key: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.put("k", &vec!["a".to_string(), "b".to_string()]).await;
        let got: Vec<String> = cache.get("k").await.unwrap();
        assert_eq!(got, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_miss_on_unknown_key() {
        let cache = TtlCache::new(Duration::from_secs(60));
        let got: Option<String> = cache.get("nope").await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_miss() {
        let cache = TtlCache::new(Duration::from_millis(1));
        cache.put("k", &"v".to_string()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let got: Option<String> = cache.get("k").await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.put("k", &1u32).await;
        cache.invalidate("k").await;
        let got: Option<u32> = cache.get("k").await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_type_mismatch_reads_as_miss() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.put("k", &"not a number".to_string()).await;
        let got: Option<u32> = cache.get("k").await;
        assert!(got.is_none());
    }
}
