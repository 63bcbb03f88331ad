use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use crate::error::Result;
use crate::registry::{Registry, WatchStream};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process registry backend for tests and single-node runs. Honors TTLs
/// and delivers watch snapshots just like the networked backend.
pub struct MemoryRegistry {
    entries: Arc<Mutex<BTreeMap<String, Entry>>>,
    notify: broadcast::Sender<()>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(256);
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            notify,
        }
    }

    fn live(entry: &Entry) -> bool {
        entry
            .expires_at
            .map(|deadline| Instant::now() < deadline)
            .unwrap_or(true)
    }

    async fn snapshot(
        entries: &Mutex<BTreeMap<String, Entry>>,
        prefix: &str,
    ) -> BTreeMap<String, String> {
        let entries = entries.lock().await;
        entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && Self::live(entry))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| Self::live(entry))
            .map(|entry| entry.value.clone()))
    }

    async fn get_all(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        Ok(Self::snapshot(&self.entries, prefix).await)
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let expires_at = if ttl_seconds > 0 {
            Some(Instant::now() + Duration::from_secs(ttl_seconds))
        } else {
            None
        };
        {
            let mut entries = self.entries.lock().await;
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at,
                },
            );
        }
        let _ = self.notify.send(());

        // prune the key and wake watchers once the lease runs out
        if let Some(deadline) = expires_at {
            let entries = self.entries.clone();
            let notify = self.notify.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                let mut entries = entries.lock().await;
                if let Some(entry) = entries.get(&key) {
                    if entry.expires_at == Some(deadline) {
                        entries.remove(&key);
                        drop(entries);
                        let _ = notify.send(());
                    }
                }
            });
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let removed = {
            let mut entries = self.entries.lock().await;
            entries.remove(key).is_some()
        };
        if removed {
            let _ = self.notify.send(());
        }
        Ok(())
    }

    async fn delete_all(&self, prefix: &str) -> Result<()> {
        let removed = {
            let mut entries = self.entries.lock().await;
            let before = entries.len();
            entries.retain(|key, _| !key.starts_with(prefix));
            before != entries.len()
        };
        if removed {
            let _ = self.notify.send(());
        }
        Ok(())
    }

    async fn watch_all(&self, prefix: &str) -> Result<WatchStream> {
        let rx = self.notify.subscribe();
        let entries = self.entries.clone();
        let prefix = prefix.to_string();
        let stream = futures::stream::unfold(
            (rx, entries, prefix, true),
            |(mut rx, entries, prefix, first)| async move {
                if first {
                    let snap = MemoryRegistry::snapshot(&entries, &prefix).await;
                    return Some((Ok(snap), (rx, entries, prefix, false)));
                }
                match rx.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let snap = MemoryRegistry::snapshot(&entries, &prefix).await;
                        Some((Ok(snap), (rx, entries, prefix, false)))
                    }
                    Err(broadcast::error::RecvError::Closed) => None,
                }
            },
        );
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let registry = MemoryRegistry::new();
        registry.set("a/b", "1", 0).await.unwrap();
        registry.set("a/c", "2", 0).await.unwrap();
        registry.set("x/y", "3", 0).await.unwrap();

        assert_eq!(registry.get("a/b").await.unwrap(), Some("1".to_string()));
        assert_eq!(registry.get("missing").await.unwrap(), None);

        let all = registry.get_all("a/").await.unwrap();
        assert_eq!(all.len(), 2);

        registry.delete("a/b").await.unwrap();
        assert_eq!(registry.get("a/b").await.unwrap(), None);

        registry.delete_all("a/").await.unwrap();
        assert!(registry.get_all("a/").await.unwrap().is_empty());
        assert_eq!(registry.get("x/y").await.unwrap(), Some("3".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_keys() {
        let registry = MemoryRegistry::new();
        registry.set("lease/k", "v", 2).await.unwrap();
        assert_eq!(registry.get("lease/k").await.unwrap(), Some("v".to_string()));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(registry.get("lease/k").await.unwrap(), None);
        assert!(registry.get_all("lease/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn watch_sees_initial_and_updates() {
        let registry = MemoryRegistry::new();
        registry.set("w/a", "1", 0).await.unwrap();

        let mut watch = registry.watch_all("w/").await.unwrap();
        let first = watch.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);

        registry.set("w/b", "2", 0).await.unwrap();
        let second = watch.next().await.unwrap().unwrap();
        assert_eq!(second.len(), 2);

        registry.delete("w/a").await.unwrap();
        let third = watch.next().await.unwrap().unwrap();
        assert_eq!(third.len(), 1);
        assert!(third.contains_key("w/b"));
    }
}
