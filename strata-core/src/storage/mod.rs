//! On-disk storage for Strata nodes.
//!
//! Content-addressed block files plus the per-shard diff log.

pub mod block_store;
pub mod diff_store;

pub use block_store::{compute_block_hash, BlockStore};
pub use diff_store::DiffStore;
