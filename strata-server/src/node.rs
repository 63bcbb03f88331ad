//! Glue between the cluster controller's callbacks and this node's
//! driver, router, and gateway state.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use strata_core::{
    Block, BlockPeers, DiffSource, Driver, Frontend, NodeConn, ReconcileShardOperation,
    ReconcileShardRequest, Result, Router, ShardRoleKind, ShardServer, StrataError,
};

/// Role installer for this node. Entering a master role first catches the
/// shard up against whoever held it at the previous version; a failure
/// (including divergence) leaves the role uninstalled.
pub struct NodeShardServer {
    driver: Arc<Driver>,
    router: Arc<Router>,
}

impl NodeShardServer {
    pub fn new(driver: Arc<Driver>, router: Arc<Router>) -> Self {
        Self { driver, router }
    }
}

#[async_trait]
impl ShardServer for NodeShardServer {
    async fn add_shard(&self, shard: u64, version: i64, kind: ShardRoleKind) -> Result<()> {
        if kind == ShardRoleKind::Master && version > 0 {
            let sources: Vec<Arc<dyn DiffSource>> =
                match self.router.holder_conns(shard, version - 1).await {
                    Ok(conns) => conns
                        .into_iter()
                        .map(|conn| Arc::new(conn) as Arc<dyn DiffSource>)
                        .collect(),
                    // no published addresses for the prior epoch: nothing
                    // to catch up from
                    Err(StrataError::NotFound(_)) => Vec::new(),
                    Err(err) => return Err(err),
                };
            if !sources.is_empty() {
                let result = ReconcileShardOperation::new(self.driver.clone())
                    .run(ReconcileShardRequest { shard, sources })
                    .await?;
                if result.diffs_pulled > 0 {
                    tracing::info!(
                        "caught up shard {} with {} diffs from {} repos",
                        shard,
                        result.diffs_pulled,
                        result.repos_checked
                    );
                }
            }
        }
        self.driver.add_shard(shard, version, kind).await
    }

    async fn remove_shard(&self, shard: u64, version: i64) -> Result<()> {
        self.driver.remove_shard(shard, version).await
    }

    async fn local_shards(&self) -> Result<std::collections::BTreeSet<u64>> {
        Ok(self.driver.local_shards().await)
    }
}

/// Tracks the newest cluster-wide role version; public requests route at
/// whatever this has reached.
pub struct GatewayFrontend {
    version: Arc<AtomicI64>,
}

impl GatewayFrontend {
    pub fn new(version: Arc<AtomicI64>) -> Self {
        Self { version }
    }
}

#[async_trait]
impl Frontend for GatewayFrontend {
    async fn version(&self, version: i64) -> Result<()> {
        tracing::info!("frontend moved to route version {}", version);
        self.version.store(version, Ordering::SeqCst);
        Ok(())
    }
}

/// Block placement and resolution by block shard, over the internal API.
pub struct RoutedBlockPeers {
    router: Arc<Router>,
}

impl RoutedBlockPeers {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl BlockPeers for RoutedBlockPeers {
    async fn fetch(&self, block: &Block, offset: u64, size: u64, version: i64) -> Result<Bytes> {
        let shard = self.router.sharder().shard_for_block(block);
        match self.router.master_or_replica_conn(shard, version).await? {
            // the caller already missed the local store
            NodeConn::Local => Err(StrataError::NotFound(format!("block {}", block.hash))),
            NodeConn::Remote(client) => client.get_block(block, offset, size).await,
        }
    }

    async fn store(&self, block: &Block, data: Bytes, version: i64) -> Result<()> {
        let shard = self.router.sharder().shard_for_block(block);
        match self.router.master_conn(shard, version).await {
            // local writes already landed in the local store
            Ok(NodeConn::Local) => Ok(()),
            Ok(NodeConn::Remote(client)) => client.put_block_exact(block, data).await,
            // no addresses yet (single node warming up): keep the block local
            Err(StrataError::NotFound(_)) | Err(StrataError::InvalidArgument(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
