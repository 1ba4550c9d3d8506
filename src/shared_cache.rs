/// the shared external cache collaborator.
///
/// the poller and workers read and write this store with no
/// transactional coordination; correctness comes from last-writer
/// timestamp semantics plus idempotent consumption on the worker side.
/// production deployments back this with redis or memcached; the
/// in-memory impl here covers tests and local runs.
use anyhow::Result;
use futures::future::BoxFuture;
use hashbrown::HashMap;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub trait SharedCache: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>>>;

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Value,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<()>>;

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }
}

/// in-memory `SharedCache` for tests and local runs
#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SharedCache for MemoryCache {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().expect("cache lock poisoned");
            match entries.get(key) {
                Some(entry) if entry.expired() => {
                    entries.remove(key);
                    Ok(None)
                }
                Some(entry) => Ok(Some(entry.value.clone())),
                None => Ok(None),
            }
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Value,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let entry = Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            };
            self.entries
                .lock()
                .expect("cache lock poisoned")
                .insert(key.to_string(), entry);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries
                .lock()
                .expect("cache lock poisoned")
                .remove(key);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_delete() {
        async_std::task::block_on(async move {
            let cache = MemoryCache::new();
            assert!(cache.is_empty());

            cache
                .set("config", json!({"ttl": 300}), None)
                .await
                .unwrap();
            assert_eq!(cache.len(), 1);
            assert_eq!(
                cache.get("config").await.unwrap(),
                Some(json!({"ttl": 300}))
            );

            cache.delete("config").await.unwrap();
            assert_eq!(cache.get("config").await.unwrap(), None);
        });
    }

    #[test]
    fn ttl_expiry() {
        async_std::task::block_on(async move {
            let cache = MemoryCache::new();
            cache
                .set("stamp", json!(100), Some(Duration::from_millis(0)))
                .await
                .unwrap();

            assert_eq!(cache.get("stamp").await.unwrap(), None);
        });
    }

    #[test]
    fn missing_key_is_none() {
        async_std::task::block_on(async move {
            let cache = MemoryCache::new();
            assert_eq!(cache.get("nope").await.unwrap(), None);
        });
    }
}
