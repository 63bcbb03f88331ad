//! Cluster role assignment and membership.
//!
//! Every storage node heartbeats a `ServerState` into the discovery store
//! under a TTL and watches its own role directory. A single elected
//! controller instance watches the membership and publishes versioned
//! `ServerRole` and `Addresses` records; nodes install new roles through
//! their local `ShardServer` and advertise the installed version back
//! through the heartbeat.

mod assign;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StrataError};
use crate::registry::{Registry, WatchStream};

pub const INVALID_VERSION: i64 = -1;

/// Heartbeat record for one storage node, expiring on TTL. `version` is
/// the newest role version the node has fully installed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerState {
    pub address: String,
    pub version: i64,
    #[serde(default)]
    pub shards: BTreeSet<u64>,
}

/// Role assignment for one server at one version. Several versions of a
/// server's role coexist during a rolling handover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRole {
    pub address: String,
    pub version: i64,
    #[serde(default)]
    pub masters: BTreeSet<u64>,
    #[serde(default)]
    pub replicas: BTreeSet<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontendState {
    pub address: String,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardAddresses {
    pub master: String,
    #[serde(default)]
    pub replicas: BTreeSet<String>,
}

/// The public routing table for one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Addresses {
    pub version: i64,
    pub addresses: BTreeMap<u64, ShardAddresses>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardRoleKind {
    Master,
    Replica,
}

/// Installed on a storage node; the controller's fill-roles loop drives it
/// as role versions appear and expire.
#[async_trait]
pub trait ShardServer: Send + Sync {
    /// Become responsible for `shard` at role version `version`. Must be
    /// idempotent. For masters this is the point where catch-up against
    /// the previous holders happens.
    async fn add_shard(&self, shard: u64, version: i64, kind: ShardRoleKind) -> Result<()>;

    /// Drop responsibility for `shard` held at `version`.
    async fn remove_shard(&self, shard: u64, version: i64) -> Result<()>;

    /// Shards this node currently hosts; advertised by the heartbeat.
    async fn local_shards(&self) -> Result<BTreeSet<u64>>;
}

/// Installed on a gateway; told whenever the whole cluster has caught up
/// to a new minimum version.
#[async_trait]
pub trait Frontend: Send + Sync {
    async fn version(&self, version: i64) -> Result<()>;
}

/// Process-wide constants, fixed at construction.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub hold_ttl_seconds: u64,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            hold_ttl_seconds: 20,
        }
    }
}

pub struct ClusterController {
    registry: Arc<dyn Registry>,
    namespace: String,
    num_shards: u64,
    num_replicas: u64,
    opts: ControllerOptions,
    addresses: RwLock<HashMap<i64, Arc<Addresses>>>,
}

impl ClusterController {
    pub fn new(
        registry: Arc<dyn Registry>,
        namespace: impl Into<String>,
        num_shards: u64,
        num_replicas: u64,
        opts: ControllerOptions,
    ) -> Self {
        Self {
            registry,
            namespace: namespace.into(),
            num_shards,
            num_replicas,
            opts,
            addresses: RwLock::new(HashMap::new()),
        }
    }

    pub fn num_shards(&self) -> u64 {
        self.num_shards
    }

    pub fn num_replicas(&self) -> u64 {
        self.num_replicas
    }

    /// Routing table for one epoch, cached after first read.
    pub async fn get_addresses(&self, version: i64) -> Result<Arc<Addresses>> {
        if version == INVALID_VERSION {
            return Err(StrataError::InvalidArgument(
                "invalid route version".to_string(),
            ));
        }
        {
            let cache = self.addresses.read().await;
            if let Some(addresses) = cache.get(&version) {
                return Ok(addresses.clone());
            }
        }
        let mut cache = self.addresses.write().await;
        if let Some(addresses) = cache.get(&version) {
            return Ok(addresses.clone());
        }
        let encoded = self
            .registry
            .get(&self.addresses_key(version))
            .await?
            .ok_or_else(|| StrataError::NotFound(format!("addresses version {}", version)))?;
        let addresses: Arc<Addresses> = Arc::new(serde_json::from_str(&encoded)?);
        cache.insert(version, addresses.clone());
        Ok(addresses)
    }

    pub async fn get_master_address(&self, shard: u64, version: i64) -> Result<Option<String>> {
        let addresses = self.get_addresses(version).await?;
        Ok(addresses
            .addresses
            .get(&shard)
            .map(|entry| entry.master.clone()))
    }

    pub async fn get_replica_addresses(&self, shard: u64, version: i64) -> Result<BTreeSet<String>> {
        let addresses = self.get_addresses(version).await?;
        addresses
            .addresses
            .get(&shard)
            .map(|entry| entry.replicas.clone())
            .ok_or_else(|| StrataError::NotFound(format!("shard {}", shard)))
    }

    /// Run a storage node's membership: heartbeat plus role watching.
    /// Returns `Cancelled` when the token fires.
    pub async fn register(
        &self,
        address: &str,
        server: Arc<dyn ShardServer>,
        cancel: CancellationToken,
    ) -> Result<()> {
        tracing::info!("registering server {}", address);
        let (version_tx, version_rx) = mpsc::channel(16);
        let result = tokio::try_join!(
            self.announce_server(address, server.clone(), version_rx, cancel.clone()),
            self.fill_roles(address, server, version_tx, cancel.clone()),
        );
        tracing::info!("server {} deregistered", address);
        result.map(|_| ())
    }

    /// Run a gateway's membership: heartbeat plus version following.
    pub async fn register_frontend(
        &self,
        address: &str,
        frontend: Arc<dyn Frontend>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (version_tx, version_rx) = mpsc::channel(16);
        tokio::try_join!(
            self.announce_frontend(address, version_rx, cancel.clone()),
            self.run_frontend(frontend, version_tx, cancel.clone()),
        )
        .map(|_| ())
    }

    async fn announce_server(
        &self,
        address: &str,
        server: Arc<dyn ShardServer>,
        mut version_rx: mpsc::Receiver<i64>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut state = ServerState {
            address: address.to_string(),
            version: INVALID_VERSION,
            shards: BTreeSet::new(),
        };
        loop {
            state.shards = server.local_shards().await?;
            let encoded = serde_json::to_string(&state)?;
            if let Err(err) = self
                .registry
                .set(&self.server_state_key(address), &encoded, self.opts.hold_ttl_seconds)
                .await
            {
                tracing::warn!("failed to publish state for {}: {}", address, err);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(StrataError::Cancelled),
                version = version_rx.recv() => {
                    if let Some(version) = version {
                        state.version = version;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(self.opts.hold_ttl_seconds / 2)) => {}
            }
        }
    }

    async fn announce_frontend(
        &self,
        address: &str,
        mut version_rx: mpsc::Receiver<i64>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut state = FrontendState {
            address: address.to_string(),
            version: INVALID_VERSION,
        };
        loop {
            let encoded = serde_json::to_string(&state)?;
            if let Err(err) = self
                .registry
                .set(&self.frontend_state_key(address), &encoded, self.opts.hold_ttl_seconds)
                .await
            {
                tracing::warn!("failed to publish frontend state for {}: {}", address, err);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(StrataError::Cancelled),
                version = version_rx.recv() => {
                    if let Some(version) = version {
                        state.version = version;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(self.opts.hold_ttl_seconds / 2)) => {}
            }
        }
    }

    /// Watch this server's role directory and reconcile the local shard
    /// set with whatever versions are published. At most the two newest
    /// versions are honored at once so a rolling handover can keep the old
    /// epoch serving while the new one warms up.
    async fn fill_roles(
        &self,
        address: &str,
        server: Arc<dyn ShardServer>,
        version_tx: mpsc::Sender<i64>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut old_roles: BTreeMap<i64, ServerRole> = BTreeMap::new();
        let mut watch = self.registry.watch_all(&self.server_role_key(address)).await?;
        loop {
            let snapshot = self.next_snapshot(&mut watch, &cancel).await?;
            let mut roles: BTreeMap<i64, ServerRole> = BTreeMap::new();
            for encoded in snapshot.values() {
                let role: ServerRole = serde_json::from_str(encoded)?;
                roles.insert(role.version, role);
            }
            let keep: BTreeSet<i64> = roles.keys().rev().take(2).copied().collect();

            // install new versions, oldest first
            let mut install_failed = false;
            for &version in &keep {
                if old_roles.contains_key(&version) {
                    continue;
                }
                let role = roles[&version].clone();
                if let Err(err) = self
                    .install_role(&role, &old_roles, server.as_ref())
                    .await
                {
                    // keep heartbeating at the prior version; the
                    // controller will retry or reassign on its next pass
                    tracing::warn!(
                        "failed to install role version {} on {}: {}",
                        version,
                        address,
                        err
                    );
                    install_failed = true;
                    break;
                }
                tracing::info!("installed role version {} on {}", version, address);
                old_roles.insert(version, role);
                if version_tx.send(version).await.is_err() {
                    return Err(StrataError::Cancelled);
                }
            }
            if install_failed {
                continue;
            }

            // drop shards whose versions expired out of the snapshot
            let expired: Vec<i64> = old_roles
                .keys()
                .copied()
                .filter(|version| !roles.contains_key(version))
                .collect();
            for version in expired {
                let role = old_roles[&version].clone();
                let to_remove: Vec<u64> = role_shards(&role)
                    .into_iter()
                    .filter(|&shard| !any_role_has_shard(&roles, shard))
                    .collect();
                let removals = to_remove
                    .iter()
                    .map(|&shard| server.remove_shard(shard, version));
                if let Err(err) = futures::future::try_join_all(removals).await {
                    tracing::warn!(
                        "failed to retire role version {} on {}: {}",
                        version,
                        address,
                        err
                    );
                    continue;
                }
                tracing::info!("retired role version {} on {}", version, address);
                old_roles.remove(&version);
            }
            old_roles.retain(|version, _| keep.contains(version));
        }
    }

    async fn install_role(
        &self,
        role: &ServerRole,
        old_roles: &BTreeMap<i64, ServerRole>,
        server: &dyn ShardServer,
    ) -> Result<()> {
        let mut additions = Vec::new();
        for &shard in &role.masters {
            if !any_role_has_shard(old_roles, shard) {
                additions.push((shard, ShardRoleKind::Master));
            }
        }
        for &shard in &role.replicas {
            if !any_role_has_shard(old_roles, shard) {
                additions.push((shard, ShardRoleKind::Replica));
            }
        }
        // shards install in parallel; the first error aborts the rest
        futures::future::try_join_all(
            additions
                .into_iter()
                .map(|(shard, kind)| server.add_shard(shard, role.version, kind)),
        )
        .await?;
        Ok(())
    }

    async fn run_frontend(
        &self,
        frontend: Arc<dyn Frontend>,
        version_tx: mpsc::Sender<i64>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut version = INVALID_VERSION;
        let mut watch = self.registry.watch_all(&self.server_state_dir()).await?;
        loop {
            let snapshot = self.next_snapshot(&mut watch, &cancel).await?;
            if snapshot.is_empty() {
                continue;
            }
            let mut min_version = i64::MAX;
            for encoded in snapshot.values() {
                let state: ServerState = serde_json::from_str(encoded)?;
                min_version = min_version.min(state.version);
            }
            if min_version > version {
                frontend.version(min_version).await?;
                version = min_version;
                if version_tx.send(version).await.is_err() {
                    return Err(StrataError::Cancelled);
                }
            }
        }
    }

    /// The elected controller loop: watch membership, recompute roles on
    /// change, publish them with a fresh version, and garbage-collect role
    /// versions every frontend has moved past.
    pub async fn assign_roles(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("assigning roles in namespace {}", self.namespace);
        let mut version: i64 = 0;
        let mut old_servers: BTreeSet<String> = BTreeSet::new();
        let mut old_masters: BTreeMap<u64, String> = BTreeMap::new();
        let mut old_replicas: BTreeMap<u64, Vec<String>> = BTreeMap::new();
        let mut old_min_version: i64 = 0;

        // reconstruct state left behind by a previous controller run
        let mut newest_roles: BTreeMap<String, ServerRole> = BTreeMap::new();
        for encoded in self.registry.get_all(&self.server_role_dir()).await?.values() {
            let role: ServerRole = serde_json::from_str(encoded)?;
            version = version.max(role.version + 1);
            let newest = newest_roles
                .get(&role.address)
                .map(|existing| existing.version < role.version)
                .unwrap_or(true);
            if newest {
                newest_roles.insert(role.address.clone(), role);
            }
        }
        for role in newest_roles.values() {
            old_servers.insert(role.address.clone());
            for &shard in &role.masters {
                old_masters.insert(shard, role.address.clone());
            }
            for &shard in &role.replicas {
                old_replicas
                    .entry(shard)
                    .or_default()
                    .push(role.address.clone());
            }
        }

        let mut watch = self.registry.watch_all(&self.server_state_dir()).await?;
        loop {
            let snapshot = self.next_snapshot(&mut watch, &cancel).await?;
            if snapshot.is_empty() {
                continue;
            }
            let mut states: BTreeMap<String, ServerState> = BTreeMap::new();
            for encoded in snapshot.values() {
                let state: ServerState = serde_json::from_str(encoded)?;
                states.insert(state.address.clone(), state);
            }

            // delete role versions every server and frontend has moved past
            let min_version = states
                .values()
                .map(|state| state.version)
                .min()
                .unwrap_or(INVALID_VERSION);
            if min_version > old_min_version {
                old_min_version = min_version;
                self.wait_frontends_at(min_version, &cancel).await?;
                for (key, encoded) in self.registry.get_all(&self.server_role_dir()).await? {
                    let role: ServerRole = serde_json::from_str(&encoded)?;
                    if role.version < min_version {
                        self.registry.delete(&key).await?;
                        tracing::info!(
                            "deleted role version {} for {}",
                            role.version,
                            role.address
                        );
                    }
                }
            }

            // identical membership assigns identically: nothing to do
            if states.keys().cloned().collect::<BTreeSet<_>>() == old_servers {
                continue;
            }

            let Some(pass) = assign::plan_assignment(
                self.num_shards,
                self.num_replicas,
                version,
                &states,
                &old_masters,
                &old_replicas,
            ) else {
                tracing::error!(
                    "cannot assign {} shards with {} replicas across {} servers",
                    self.num_shards,
                    self.num_replicas,
                    states.len()
                );
                continue;
            };

            for (address, role) in &pass.roles {
                let encoded = serde_json::to_string(role)?;
                self.registry
                    .set(&self.server_role_version_key(address, version), &encoded, 0)
                    .await?;
                tracing::info!(
                    "assigned version {} to {}: {} masters, {} replicas",
                    version,
                    address,
                    role.masters.len(),
                    role.replicas.len()
                );
            }
            let encoded = serde_json::to_string(&pass.addresses)?;
            self.registry
                .set(&self.addresses_key(version), &encoded, 0)
                .await?;
            tracing::info!("published addresses for version {}", version);

            version += 1;
            old_servers = states.keys().cloned().collect();
            old_masters = pass.masters;
            old_replicas = pass.replicas;
        }
    }

    async fn wait_frontends_at(&self, min_version: i64, cancel: &CancellationToken) -> Result<()> {
        let mut watch = self.registry.watch_all(&self.frontend_state_dir()).await?;
        loop {
            let snapshot = self.next_snapshot(&mut watch, cancel).await?;
            let mut ready = true;
            for encoded in snapshot.values() {
                let state: FrontendState = serde_json::from_str(encoded)?;
                if state.version < min_version {
                    ready = false;
                    break;
                }
            }
            if ready {
                return Ok(());
            }
        }
    }

    /// Block until every listed server agrees on a single role version and
    /// every listed frontend has reached it. A test and tooling helper.
    pub async fn wait_for_availability(
        &self,
        frontend_addresses: &[String],
        server_addresses: &[String],
        cancel: CancellationToken,
    ) -> Result<()> {
        let version;
        let mut watch = self.registry.watch_all(&self.server_dir()).await?;
        'servers: loop {
            let snapshot = self.next_snapshot(&mut watch, &cancel).await?;
            let mut states: BTreeMap<String, ServerState> = BTreeMap::new();
            let mut roles: BTreeMap<String, BTreeSet<i64>> = BTreeMap::new();
            for (key, encoded) in &snapshot {
                if key.starts_with(&self.server_state_dir()) {
                    let state: ServerState = serde_json::from_str(encoded)?;
                    states.insert(state.address.clone(), state);
                } else if key.starts_with(&self.server_role_dir()) {
                    let role: ServerRole = serde_json::from_str(encoded)?;
                    roles.entry(role.address.clone()).or_default().insert(role.version);
                }
            }
            if states.len() != server_addresses.len() || roles.len() != server_addresses.len() {
                continue;
            }
            for address in server_addresses {
                if !states.contains_key(address) || !roles.contains_key(address) {
                    continue 'servers;
                }
            }
            let versions: BTreeSet<i64> = states.values().map(|state| state.version).collect();
            if versions.contains(&INVALID_VERSION) || versions.len() != 1 {
                continue;
            }
            let agreed = *versions.iter().next().unwrap_or(&INVALID_VERSION);
            for server_versions in roles.values() {
                if server_versions.len() != 1 || !server_versions.contains(&agreed) {
                    continue 'servers;
                }
            }
            version = agreed;
            break;
        }

        let mut watch = self.registry.watch_all(&self.frontend_state_dir()).await?;
        loop {
            let snapshot = self.next_snapshot(&mut watch, &cancel).await?;
            let mut frontends: BTreeMap<String, FrontendState> = BTreeMap::new();
            let mut all_caught_up = true;
            for encoded in snapshot.values() {
                let state: FrontendState = serde_json::from_str(encoded)?;
                if state.version != version {
                    all_caught_up = false;
                    break;
                }
                frontends.insert(state.address.clone(), state);
            }
            if !all_caught_up || frontends.len() != frontend_addresses.len() {
                continue;
            }
            if frontend_addresses
                .iter()
                .all(|address| frontends.contains_key(address))
            {
                return Ok(());
            }
        }
    }

    async fn next_snapshot(
        &self,
        watch: &mut WatchStream,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>> {
        tokio::select! {
            _ = cancel.cancelled() => Err(StrataError::Cancelled),
            item = watch.next() => match item {
                Some(snapshot) => snapshot,
                None => Err(StrataError::Transient("discovery watch ended".to_string())),
            },
        }
    }

    fn route_dir(&self) -> String {
        format!("{}/pfs/route", self.namespace)
    }

    fn server_dir(&self) -> String {
        format!("{}/server", self.route_dir())
    }

    fn server_state_dir(&self) -> String {
        format!("{}/state", self.server_dir())
    }

    fn server_state_key(&self, address: &str) -> String {
        format!("{}/{}", self.server_state_dir(), address)
    }

    fn server_role_dir(&self) -> String {
        format!("{}/role", self.server_dir())
    }

    fn server_role_key(&self, address: &str) -> String {
        format!("{}/{}", self.server_role_dir(), address)
    }

    fn server_role_version_key(&self, address: &str, version: i64) -> String {
        format!("{}/{}", self.server_role_key(address), version)
    }

    fn frontend_state_dir(&self) -> String {
        format!("{}/frontend/state", self.route_dir())
    }

    fn frontend_state_key(&self, address: &str) -> String {
        format!("{}/{}", self.frontend_state_dir(), address)
    }

    fn addresses_key(&self, version: i64) -> String {
        format!("{}/addresses/{}", self.route_dir(), version)
    }
}

fn role_shards(role: &ServerRole) -> BTreeSet<u64> {
    role.masters.union(&role.replicas).copied().collect()
}

fn any_role_has_shard(roles: &BTreeMap<i64, ServerRole>, shard: u64) -> bool {
    roles
        .values()
        .any(|role| role.masters.contains(&shard) || role.replicas.contains(&shard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use tokio::sync::Mutex;

    struct StubServer {
        shards: Mutex<BTreeSet<u64>>,
        added: Mutex<Vec<(u64, i64, ShardRoleKind)>>,
        removed: Mutex<Vec<(u64, i64)>>,
    }

    impl StubServer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                shards: Mutex::new(BTreeSet::new()),
                added: Mutex::new(Vec::new()),
                removed: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ShardServer for StubServer {
        async fn add_shard(&self, shard: u64, version: i64, kind: ShardRoleKind) -> Result<()> {
            self.shards.lock().await.insert(shard);
            self.added.lock().await.push((shard, version, kind));
            Ok(())
        }

        async fn remove_shard(&self, shard: u64, version: i64) -> Result<()> {
            self.shards.lock().await.remove(&shard);
            self.removed.lock().await.push((shard, version));
            Ok(())
        }

        async fn local_shards(&self) -> Result<BTreeSet<u64>> {
            Ok(self.shards.lock().await.clone())
        }
    }

    fn controller(registry: Arc<dyn Registry>) -> Arc<ClusterController> {
        Arc::new(ClusterController::new(
            registry,
            "test",
            32,
            1,
            ControllerOptions {
                hold_ttl_seconds: 2,
            },
        ))
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn register_publishes_server_state() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let controller = controller(registry.clone());
        let server = StubServer::new();
        server.shards.lock().await.insert(7);

        let cancel = CancellationToken::new();
        let task = {
            let controller = controller.clone();
            let server = server.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.register("s1:650", server, cancel).await })
        };

        eventually(|| async {
            registry
                .get("test/pfs/route/server/state/s1:650")
                .await
                .unwrap()
                .is_some()
        })
        .await;

        let encoded = registry
            .get("test/pfs/route/server/state/s1:650")
            .await
            .unwrap()
            .unwrap();
        let state: ServerState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(state.address, "s1:650");
        assert_eq!(state.version, INVALID_VERSION);
        assert!(state.shards.contains(&7));

        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(StrataError::Cancelled)));
    }

    #[tokio::test]
    async fn fill_roles_installs_published_roles() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let controller = controller(registry.clone());
        let server = StubServer::new();

        let cancel = CancellationToken::new();
        let task = {
            let controller = controller.clone();
            let server = server.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.register("s1:650", server, cancel).await })
        };

        let role = ServerRole {
            address: "s1:650".to_string(),
            version: 0,
            masters: [1u64, 2].into_iter().collect(),
            replicas: [3u64].into_iter().collect(),
        };
        registry
            .set(
                "test/pfs/route/server/role/s1:650/0",
                &serde_json::to_string(&role).unwrap(),
                0,
            )
            .await
            .unwrap();

        eventually(|| async { server.added.lock().await.len() == 3 }).await;
        let added = server.added.lock().await.clone();
        assert!(added.contains(&(1, 0, ShardRoleKind::Master)));
        assert!(added.contains(&(2, 0, ShardRoleKind::Master)));
        assert!(added.contains(&(3, 0, ShardRoleKind::Replica)));

        // the heartbeat eventually advertises the installed version
        eventually(|| async {
            let encoded = registry
                .get("test/pfs/route/server/state/s1:650")
                .await
                .unwrap();
            match encoded {
                Some(encoded) => {
                    let state: ServerState = serde_json::from_str(&encoded).unwrap();
                    state.version == 0
                }
                None => false,
            }
        })
        .await;

        cancel.cancel();
        let _ = task.await.unwrap();
    }

    #[tokio::test]
    async fn assign_roles_publishes_roles_and_addresses() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());
        let controller = controller(registry.clone());

        // membership is in place before the controller starts, so its
        // first pass sees all three servers at once
        for address in ["s1:650", "s2:650", "s3:650"] {
            let state = ServerState {
                address: address.to_string(),
                version: INVALID_VERSION,
                shards: BTreeSet::new(),
            };
            registry
                .set(
                    &format!("test/pfs/route/server/state/{}", address),
                    &serde_json::to_string(&state).unwrap(),
                    0,
                )
                .await
                .unwrap();
        }

        let cancel = CancellationToken::new();
        let task = {
            let controller = controller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.assign_roles(cancel).await })
        };

        eventually(|| async {
            registry
                .get("test/pfs/route/addresses/0")
                .await
                .unwrap()
                .is_some()
        })
        .await;

        let addresses = controller.get_addresses(0).await.unwrap();
        assert_eq!(addresses.version, 0);
        assert_eq!(addresses.addresses.len(), 32);
        for entry in addresses.addresses.values() {
            assert!(!entry.master.is_empty());
            assert_eq!(entry.replicas.len(), 1);
            assert!(!entry.replicas.contains(&entry.master));
        }

        let roles = registry
            .get_all("test/pfs/route/server/role/")
            .await
            .unwrap();
        assert_eq!(roles.len(), 3);
        for encoded in roles.values() {
            let role: ServerRole = serde_json::from_str(encoded).unwrap();
            assert!(role.masters.len() == 10 || role.masters.len() == 11);
            assert!(role.replicas.len() == 10 || role.replicas.len() == 11);
        }

        // a membership change produces the next epoch without touching the
        // old one: readers on version 0 keep working while version 1 rolls
        registry
            .delete("test/pfs/route/server/state/s3:650")
            .await
            .unwrap();
        eventually(|| async {
            registry
                .get("test/pfs/route/addresses/1")
                .await
                .unwrap()
                .is_some()
        })
        .await;
        assert!(registry
            .get("test/pfs/route/addresses/0")
            .await
            .unwrap()
            .is_some());
        assert!(!registry
            .get_all("test/pfs/route/server/role/")
            .await
            .unwrap()
            .is_empty());

        let next = controller.get_addresses(1).await.unwrap();
        for entry in next.addresses.values() {
            assert_ne!(entry.master, "s3:650");
        }

        cancel.cancel();
        let _ = task.await.unwrap();
    }
}
