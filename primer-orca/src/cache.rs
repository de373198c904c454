use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// String key/value store with per-key expiry, shared by every orchestrator
/// instance.
///
/// Backs the resource ledger and the task liveness memo. Implementations
/// only need single-key atomicity; nothing in this crate relies on
/// multi-key transactions.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()>;

    /// Fetch a live value.
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// List live keys matching a glob (`*` and `?`).
    async fn keys(&self, pattern: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Clone, Debug)]
struct CacheEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Process-local [`SharedCache`].
///
/// Expired entries are evicted lazily on access.
#[derive(Clone, Default, Debug)]
pub struct InMemoryCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining lifetime of a key, if present.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Utc::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.expires_at - now)
    }
}

#[async_trait]
impl SharedCache for InMemoryCache {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        let entry = CacheEntry {
            value,
            expires_at: Utc::now() + ttl,
        };
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Utc::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.expires_at > now);
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Match `text` against a glob supporting `*` (any run) and `?` (any char).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", ""));
        assert!(glob_match("threads_allocated@job_*", "threads_allocated@job_42"));
        assert!(!glob_match("threads_allocated@job_*", "task.running:42"));
        assert!(glob_match("*primer_run*", "primer_run-w3"));
        assert!(glob_match("w?", "w1"));
        assert!(!glob_match("w?", "w12"));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("a*b*c", "axxbyy"));
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = InMemoryCache::new();
        cache
            .set("k", "v".into(), Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        cache.set("k", "w".into(), Duration::seconds(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("w"));

        cache.delete("k").await.unwrap();
        assert!(cache.get("k").await.unwrap().is_none());
        // Deleting again is fine.
        cache.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_entries_disappear() {
        let cache = InMemoryCache::new();
        cache
            .set("gone", "1".into(), Duration::milliseconds(-1))
            .await
            .unwrap();
        cache
            .set("kept", "1".into(), Duration::seconds(60))
            .await
            .unwrap();

        assert!(cache.get("gone").await.unwrap().is_none());
        assert_eq!(cache.keys("*").await.unwrap(), vec!["kept".to_string()]);
        assert_eq!(cache.len(), 1);
        assert!(cache.ttl("kept").unwrap() > Duration::seconds(50));
    }

    #[tokio::test]
    async fn test_keys_filters_by_pattern() {
        let cache = InMemoryCache::new();
        for key in ["a:1", "a:2", "b:1"] {
            cache
                .set(key, "x".into(), Duration::seconds(60))
                .await
                .unwrap();
        }
        assert_eq!(
            cache.keys("a:*").await.unwrap(),
            vec!["a:1".to_string(), "a:2".to_string()]
        );
    }
}
