use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Node configuration, loaded from a file with `STRATA_*` environment
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    pub node: NodeConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub bind_addr: String,
    #[serde(default)]
    pub advertise_addr: Option<String>,
    pub data_dir: PathBuf,
}

impl NodeConfig {
    pub fn effective_address(&self) -> String {
        self.advertise_addr
            .clone()
            .unwrap_or_else(|| self.bind_addr.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_num_shards")]
    pub num_shards: u64,
    #[serde(default)]
    pub num_replicas: u64,
    #[serde(default = "default_block_size_bytes")]
    pub block_size_bytes: usize,
    #[serde(default = "default_hold_ttl_seconds")]
    pub hold_ttl_seconds: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            num_shards: default_num_shards(),
            num_replicas: 0,
            block_size_bytes: default_block_size_bytes(),
            hold_ttl_seconds: default_hold_ttl_seconds(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_num_shards() -> u64 {
    32
}

fn default_block_size_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_hold_ttl_seconds() -> u64 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    #[serde(default)]
    pub etcd: Option<EtcdConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    Etcd,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
}

impl StrataConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("STRATA").separator("__"))
            .build()
            .map_err(|e| StrataError::Config(e.to_string()))?;

        let config: StrataConfig = settings
            .try_deserialize()
            .map_err(|e| StrataError::Config(e.to_string()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let toml = r#"
            [node]
            bind_addr = "0.0.0.0:650"
            data_dir = "/var/lib/strata"

            [registry]
            backend = "memory"
        "#;
        let settings = ::config::Config::builder()
            .add_source(::config::File::from_str(toml, ::config::FileFormat::Toml))
            .build()
            .unwrap();
        let config: StrataConfig = settings.try_deserialize().unwrap();
        assert_eq!(config.cluster.num_shards, 32);
        assert_eq!(config.cluster.num_replicas, 0);
        assert_eq!(config.cluster.block_size_bytes, 8 * 1024 * 1024);
        assert_eq!(config.cluster.hold_ttl_seconds, 20);
        assert_eq!(config.cluster.namespace, "default");
        assert_eq!(config.node.effective_address(), "0.0.0.0:650");
        assert_eq!(config.registry.backend, RegistryBackend::Memory);
    }

    #[test]
    fn advertise_addr_wins() {
        let node = NodeConfig {
            bind_addr: "0.0.0.0:650".to_string(),
            advertise_addr: Some("node1.internal:650".to_string()),
            data_dir: PathBuf::from("/tmp"),
        };
        assert_eq!(node.effective_address(), "node1.internal:650");
    }
}
