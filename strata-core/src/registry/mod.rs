//! Discovery-store abstraction.
//!
//! The cluster controller keeps all of its coordination state in a watched
//! key-value store. `Registry` is the capability set it needs: reads,
//! TTL'd writes, deletes, and prefix watches delivered as snapshot streams.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{Result, StrataError};

pub mod etcd;
pub mod memory;

pub use etcd::EtcdRegistry;
pub use memory::MemoryRegistry;

/// Each item is a full snapshot of the watched prefix; the first item is
/// delivered immediately. Dropping the stream cancels the watch.
pub type WatchStream = BoxStream<'static, Result<BTreeMap<String, String>>>;

#[async_trait]
pub trait Registry: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn get_all(&self, prefix: &str) -> Result<BTreeMap<String, String>>;

    /// Set a key. A non-zero `ttl_seconds` makes the key expire unless it
    /// is refreshed.
    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_all(&self, prefix: &str) -> Result<()>;

    async fn watch_all(&self, prefix: &str) -> Result<WatchStream>;
}

#[derive(Debug, Clone, Default)]
pub struct RegistryBuilder {
    backend: Option<String>,
    etcd_endpoints: Option<Vec<String>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn etcd_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.etcd_endpoints = Some(endpoints);
        self
    }

    pub async fn build(&self) -> Result<Arc<dyn Registry>> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match backend.as_str() {
            "etcd" => {
                let endpoints = self.etcd_endpoints.clone().ok_or_else(|| {
                    StrataError::Config("etcd endpoints are required for etcd backend".to_string())
                })?;
                if endpoints.is_empty() {
                    return Err(StrataError::Config(
                        "etcd endpoints cannot be empty for etcd backend".to_string(),
                    ));
                }
                let registry = EtcdRegistry::new(&endpoints).await?;
                Ok(Arc::new(registry))
            }
            "memory" => Ok(Arc::new(MemoryRegistry::new())),
            "" => Err(StrataError::Config(
                "registry backend cannot be empty".to_string(),
            )),
            other => Err(StrataError::Config(format!(
                "unsupported registry backend: {}",
                other
            ))),
        }
    }
}
