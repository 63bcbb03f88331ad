//! Strata Core - Core library for a distributed, content-addressed,
//! commit-oriented filesystem.
//!
//! A cluster of storage nodes exposes a repo/commit/file data model:
//! - data deduplicates into immutable SHA-256-addressed blocks
//! - mutations group into per-shard commit diffs with parent lineage
//! - a discovery-backed controller assigns shard masters and replicas
//! - a version-carrying router resolves files to live nodes

pub mod client;
pub mod cluster;
pub mod config;
pub mod driver;
pub mod error;
pub mod reconcile;
pub mod registry;
pub mod router;
pub mod sharding;
pub mod storage;
pub mod types;

pub use client::{ClusterClient, CreateRepoRequest, FinishCommitRequest, StartCommitRequest};
pub use cluster::{
    Addresses, ClusterController, ControllerOptions, Frontend, FrontendState, ServerRole,
    ServerState, ShardAddresses, ShardRoleKind, ShardServer, INVALID_VERSION,
};
pub use config::{
    ClusterConfig, EtcdConfig, NodeConfig, RegistryBackend, RegistryConfig, StrataConfig,
};
pub use driver::{BlockPeers, Driver, LocalBlockPeers};
pub use error::{Result, StrataError};
pub use reconcile::{
    DiffSource, ReconcileShardOperation, ReconcileShardRequest, ReconcileShardResult,
};
pub use registry::{EtcdRegistry, MemoryRegistry, Registry, RegistryBuilder};
pub use router::{NodeConn, Router};
pub use sharding::Sharder;
pub use storage::{compute_block_hash, BlockStore, DiffStore};
pub use types::{
    Append, Block, BlockInfo, BlockRef, ByteRange, Commit, CommitInfo, CommitType, Diff, DiffInfo,
    File, FileInfo, FileType, Repo, RepoInfo, INITIAL_COMMIT_ID,
};
