use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Mutex;

use crate::client::ClusterClient;
use crate::cluster::ClusterController;
use crate::error::{Result, StrataError};
use crate::sharding::Sharder;

/// A resolved route to a shard holder. `Local` is a loopback sentinel so
/// callers can skip the network hop when the target is this node.
#[derive(Debug, Clone)]
pub enum NodeConn {
    Local,
    Remote(ClusterClient),
}

/// Resolves shards to connections using the versioned `Addresses` records
/// the controller publishes. Clients are cached by address and dialed
/// lazily; a new epoch never re-dials an address that reappears.
pub struct Router {
    sharder: Sharder,
    controller: Arc<ClusterController>,
    local_address: String,
    conns: Mutex<HashMap<String, ClusterClient>>,
}

impl Router {
    pub fn new(
        sharder: Sharder,
        controller: Arc<ClusterController>,
        local_address: impl Into<String>,
    ) -> Self {
        Self {
            sharder,
            controller,
            local_address: local_address.into(),
            conns: Mutex::new(HashMap::new()),
        }
    }

    pub fn sharder(&self) -> &Sharder {
        &self.sharder
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Shards this node masters at `version`.
    pub async fn master_shards(&self, version: i64) -> Result<BTreeSet<u64>> {
        let addresses = self.controller.get_addresses(version).await?;
        Ok(addresses
            .addresses
            .iter()
            .filter(|(_, entry)| entry.master == self.local_address)
            .map(|(&shard, _)| shard)
            .collect())
    }

    /// Shards this node replicates at `version`.
    pub async fn replica_shards(&self, version: i64) -> Result<BTreeSet<u64>> {
        let addresses = self.controller.get_addresses(version).await?;
        Ok(addresses
            .addresses
            .iter()
            .filter(|(_, entry)| entry.replicas.contains(&self.local_address))
            .map(|(&shard, _)| shard)
            .collect())
    }

    pub async fn all_shards(&self, version: i64) -> Result<BTreeSet<u64>> {
        let addresses = self.controller.get_addresses(version).await?;
        Ok(addresses
            .addresses
            .iter()
            .filter(|(_, entry)| {
                entry.master == self.local_address || entry.replicas.contains(&self.local_address)
            })
            .map(|(&shard, _)| shard)
            .collect())
    }

    pub async fn master_conn(&self, shard: u64, version: i64) -> Result<NodeConn> {
        let addresses = self.controller.get_addresses(version).await?;
        let entry = addresses
            .addresses
            .get(&shard)
            .ok_or_else(|| StrataError::NotFound(format!("shard {}", shard)))?;
        if entry.master.is_empty() {
            return Err(StrataError::NotFound(format!("no master for shard {}", shard)));
        }
        Ok(self.conn_for(&entry.master).await)
    }

    /// Local if this node holds the shard, otherwise the master, otherwise
    /// a uniformly random replica.
    pub async fn master_or_replica_conn(&self, shard: u64, version: i64) -> Result<NodeConn> {
        let addresses = self.controller.get_addresses(version).await?;
        let entry = addresses
            .addresses
            .get(&shard)
            .ok_or_else(|| StrataError::NotFound(format!("shard {}", shard)))?;
        if entry.master == self.local_address || entry.replicas.contains(&self.local_address) {
            return Ok(NodeConn::Local);
        }
        if !entry.master.is_empty() {
            return Ok(self.conn_for(&entry.master).await);
        }
        let replicas: Vec<&String> = entry.replicas.iter().collect();
        if replicas.is_empty() {
            return Err(StrataError::NotFound(format!("no holder for shard {}", shard)));
        }
        let pick = rand::thread_rng().gen_range(0..replicas.len());
        Ok(self.conn_for(replicas[pick]).await)
    }

    pub async fn replica_conns(&self, shard: u64, version: i64) -> Result<Vec<NodeConn>> {
        let addresses = self.controller.get_addresses(version).await?;
        let entry = addresses
            .addresses
            .get(&shard)
            .ok_or_else(|| StrataError::NotFound(format!("shard {}", shard)))?;
        let mut conns = Vec::with_capacity(entry.replicas.len());
        for address in &entry.replicas {
            conns.push(self.conn_for(address).await);
        }
        Ok(conns)
    }

    /// One connection per distinct address in the routing table.
    pub async fn all_conns(&self, version: i64) -> Result<Vec<NodeConn>> {
        let addresses = self.controller.get_addresses(version).await?;
        let mut distinct: BTreeSet<String> = BTreeSet::new();
        for entry in addresses.addresses.values() {
            if !entry.master.is_empty() {
                distinct.insert(entry.master.clone());
            }
            distinct.extend(entry.replicas.iter().cloned());
        }
        let mut conns = Vec::with_capacity(distinct.len());
        for address in distinct {
            conns.push(self.conn_for(&address).await);
        }
        Ok(conns)
    }

    /// Every holder of a shard (master plus replicas), excluding the local
    /// node. Used for master catch-up against the previous epoch.
    pub async fn holder_conns(&self, shard: u64, version: i64) -> Result<Vec<ClusterClient>> {
        let addresses = self.controller.get_addresses(version).await?;
        let entry = addresses
            .addresses
            .get(&shard)
            .ok_or_else(|| StrataError::NotFound(format!("shard {}", shard)))?;
        let mut holders: BTreeSet<String> = entry.replicas.clone();
        if !entry.master.is_empty() {
            holders.insert(entry.master.clone());
        }
        holders.remove(&self.local_address);
        let mut conns = Vec::with_capacity(holders.len());
        for address in holders {
            conns.push(self.client_for(&address).await);
        }
        Ok(conns)
    }

    async fn conn_for(&self, address: &str) -> NodeConn {
        if address == self.local_address {
            return NodeConn::Local;
        }
        NodeConn::Remote(self.client_for(address).await)
    }

    async fn client_for(&self, address: &str) -> ClusterClient {
        let mut conns = self.conns.lock().await;
        conns
            .entry(address.to_string())
            .or_insert_with(|| ClusterClient::new(address))
            .clone()
    }

    #[cfg(test)]
    async fn cached_conn_count(&self) -> usize {
        self.conns.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Addresses, ControllerOptions, ShardAddresses};
    use crate::registry::{MemoryRegistry, Registry};
    use std::collections::BTreeMap;

    async fn router_with_addresses() -> Router {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let mut addresses = Addresses {
            version: 3,
            addresses: BTreeMap::new(),
        };
        for shard in 0..4u64 {
            let master = if shard < 2 { "s1:650" } else { "s2:650" };
            let replica = if shard < 2 { "s2:650" } else { "s3:650" };
            addresses.addresses.insert(
                shard,
                ShardAddresses {
                    master: master.to_string(),
                    replicas: [replica.to_string()].into_iter().collect(),
                },
            );
        }
        registry
            .set(
                "test/pfs/route/addresses/3",
                &serde_json::to_string(&addresses).unwrap(),
                0,
            )
            .await
            .unwrap();
        let controller = Arc::new(ClusterController::new(
            registry,
            "test",
            4,
            1,
            ControllerOptions::default(),
        ));
        Router::new(Sharder::new(4, 4), controller, "s1:650")
    }

    #[tokio::test]
    async fn shard_sets_reflect_roles() {
        let router = router_with_addresses().await;
        let masters = router.master_shards(3).await.unwrap();
        assert_eq!(masters, [0u64, 1].into_iter().collect());
        let replicas = router.replica_shards(3).await.unwrap();
        assert_eq!(replicas, [2u64, 3].into_iter().collect());
        let all = router.all_shards(3).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn local_master_short_circuits() {
        let router = router_with_addresses().await;
        assert!(matches!(
            router.master_conn(0, 3).await.unwrap(),
            NodeConn::Local
        ));
        assert!(matches!(
            router.master_conn(2, 3).await.unwrap(),
            NodeConn::Remote(_)
        ));
        // s1 replicates shard 2, so reads stay local
        assert!(matches!(
            router.master_or_replica_conn(2, 3).await.unwrap(),
            NodeConn::Local
        ));
    }

    #[tokio::test]
    async fn connections_are_cached_by_address() {
        let router = router_with_addresses().await;
        let _ = router.master_conn(2, 3).await.unwrap();
        let _ = router.master_conn(3, 3).await.unwrap();
        assert_eq!(router.cached_conn_count().await, 1);

        let conns = router.all_conns(3).await.unwrap();
        assert_eq!(conns.len(), 3);
        let remote = conns
            .iter()
            .filter(|conn| matches!(conn, NodeConn::Remote(_)))
            .count();
        assert_eq!(remote, 2);
        assert_eq!(router.cached_conn_count().await, 2);
    }

    #[tokio::test]
    async fn unknown_version_is_not_found() {
        let router = router_with_addresses().await;
        let err = router.master_conn(0, 9).await.unwrap_err();
        assert!(matches!(err, StrataError::NotFound(_)));
    }
}
