use std::collections::BTreeMap;

use async_trait::async_trait;
use etcd_client::{Client, DeleteOptions, GetOptions, PutOptions, WatchOptions};
use futures::StreamExt;

use crate::error::{Result, StrataError};
use crate::registry::{Registry, WatchStream};

/// etcd-backed registry. TTLs ride on per-write leases; prefix watches are
/// folded into full-prefix snapshots so callers never see partial state.
pub struct EtcdRegistry {
    client: Client,
}

impl EtcdRegistry {
    pub async fn new(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await.map_err(etcd_err)?;
        Ok(Self { client })
    }

    async fn read_prefix(mut client: Client, prefix: String) -> Result<BTreeMap<String, String>> {
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(etcd_err)?;
        let mut result = BTreeMap::new();
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(etcd_err)?.to_string();
            let value = kv.value_str().map_err(etcd_err)?.to_string();
            result.insert(key, value);
        }
        Ok(result)
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(etcd_err)?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(kv.value_str().map_err(etcd_err)?.to_string())),
            None => Ok(None),
        }
    }

    async fn get_all(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        Self::read_prefix(self.client.clone(), prefix.to_string()).await
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut client = self.client.clone();
        let options = if ttl_seconds > 0 {
            let lease = client
                .lease_grant(ttl_seconds as i64, None)
                .await
                .map_err(etcd_err)?;
            Some(PutOptions::new().with_lease(lease.id()))
        } else {
            None
        };
        client.put(key, value, options).await.map_err(etcd_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(key, None).await.map_err(etcd_err)?;
        Ok(())
    }

    async fn delete_all(&self, prefix: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .delete(prefix, Some(DeleteOptions::new().with_prefix()))
            .await
            .map_err(etcd_err)?;
        Ok(())
    }

    async fn watch_all(&self, prefix: &str) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let (watcher, watch_stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(etcd_err)?;

        let snapshot_client = self.client.clone();
        let prefix = prefix.to_string();
        // The watcher handle must stay alive for the watch to stay open;
        // it travels with the stream state.
        let stream = futures::stream::unfold(
            (watcher, watch_stream, snapshot_client, prefix, true),
            |(watcher, mut watch_stream, client, prefix, first)| async move {
                if first {
                    let snap = EtcdRegistry::read_prefix(client.clone(), prefix.clone()).await;
                    return Some((snap, (watcher, watch_stream, client, prefix, false)));
                }
                match watch_stream.message().await {
                    Ok(Some(_)) => {
                        let snap = EtcdRegistry::read_prefix(client.clone(), prefix.clone()).await;
                        Some((snap, (watcher, watch_stream, client, prefix, false)))
                    }
                    Ok(None) => None,
                    Err(err) => Some((
                        Err(etcd_err(err)),
                        (watcher, watch_stream, client, prefix, false),
                    )),
                }
            },
        );
        Ok(stream.boxed())
    }
}

fn etcd_err(err: etcd_client::Error) -> StrataError {
    StrataError::Transient(format!("etcd: {}", err))
}
