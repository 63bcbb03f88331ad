use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::fs;
use tokio::sync::Mutex;

use crate::cluster::{ShardRoleKind, INVALID_VERSION};
use crate::error::{Result, StrataError};
use crate::sharding::Sharder;
use crate::storage::{BlockStore, DiffStore};
use crate::types::{
    base_name, parent_path, Append, Block, BlockRef, Commit, CommitInfo, CommitType, Diff,
    DiffInfo, File, FileInfo, FileType, Repo, RepoInfo,
};

/// The block layer's view of the rest of the cluster. Blocks place by
/// their own shard: writes offload each chunk to the block-shard holder,
/// and reads that miss the local store resolve against it.
#[async_trait]
pub trait BlockPeers: Send + Sync {
    async fn fetch(&self, block: &Block, offset: u64, size: u64, version: i64) -> Result<Bytes>;

    async fn store(&self, block: &Block, data: Bytes, version: i64) -> Result<()>;
}

/// Peers for single-node deployments and tests: every block is local.
pub struct LocalBlockPeers {
    store: Arc<BlockStore>,
}

impl LocalBlockPeers {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BlockPeers for LocalBlockPeers {
    async fn fetch(&self, block: &Block, offset: u64, size: u64, _version: i64) -> Result<Bytes> {
        self.store.get_block(block, offset, size).await
    }

    async fn store(&self, _block: &Block, _data: Bytes, _version: i64) -> Result<()> {
        Ok(())
    }
}

struct OpenCommit {
    parent: Option<Commit>,
    started: DateTime<Utc>,
    diffs: BTreeMap<u64, DiffInfo>,
}

#[derive(Default)]
struct DriverState {
    /// shard -> role version -> role held at that version. A shard is
    /// purged only once no version references it.
    shards: BTreeMap<u64, BTreeMap<i64, ShardRoleKind>>,
    installed_version: i64,
    repos: BTreeMap<String, RepoInfo>,
    open_commits: BTreeMap<(String, String), OpenCommit>,
}

impl DriverState {
    fn owns(&self, shard: u64) -> bool {
        self.shards.contains_key(&shard)
    }

    fn is_master(&self, shard: u64) -> bool {
        self.shards
            .get(&shard)
            .and_then(|versions| versions.values().next_back())
            .map(|kind| *kind == ShardRoleKind::Master)
            .unwrap_or(false)
    }

    fn owned_shards(&self) -> BTreeSet<u64> {
        self.shards.keys().copied().collect()
    }

    fn master_shards(&self) -> BTreeSet<u64> {
        self.shards
            .keys()
            .copied()
            .filter(|&shard| self.is_master(shard))
            .collect()
    }

    /// Writes carry their route version; anything below the newest
    /// installed role version is a write racing a role handover.
    fn check_write_version(&self, version: i64) -> Result<()> {
        if version != INVALID_VERSION && version < self.installed_version {
            return Err(StrataError::InvalidArgument(format!(
                "stale route version {} (current {})",
                version, self.installed_version
            )));
        }
        Ok(())
    }
}

/// The per-node engine: owns the local shard set and executes every
/// repo/commit/file operation against the local block and diff stores,
/// for the shards this node holds.
pub struct Driver {
    sharder: Sharder,
    blocks: Arc<BlockStore>,
    diffs: Arc<DiffStore>,
    peers: Arc<dyn BlockPeers>,
    state: Mutex<DriverState>,
}

impl Driver {
    pub fn new(
        sharder: Sharder,
        blocks: Arc<BlockStore>,
        diffs: Arc<DiffStore>,
        peers: Arc<dyn BlockPeers>,
    ) -> Result<Self> {
        let mut repos = BTreeMap::new();
        // repos left behind by a previous run are visible from the diff log
        let diff_dir = diffs.diff_dir();
        if diff_dir.exists() {
            for entry in std::fs::read_dir(&diff_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    let created: DateTime<Utc> = entry.metadata()?.modified()?.into();
                    repos.insert(
                        name.to_string(),
                        RepoInfo {
                            repo: Repo::new(name),
                            created,
                        },
                    );
                }
            }
        }
        Ok(Self {
            sharder,
            blocks,
            diffs,
            peers,
            state: Mutex::new(DriverState {
                repos,
                installed_version: INVALID_VERSION,
                ..Default::default()
            }),
        })
    }

    pub fn sharder(&self) -> &Sharder {
        &self.sharder
    }

    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.blocks
    }

    pub fn diff_store(&self) -> &Arc<DiffStore> {
        &self.diffs
    }

    // ---- shard ownership -------------------------------------------------

    /// Idempotent: recording the same (shard, version, role) twice leaves
    /// the driver in the same state as recording it once.
    pub async fn add_shard(&self, shard: u64, version: i64, kind: ShardRoleKind) -> Result<()> {
        let mut state = self.state.lock().await;
        state.shards.entry(shard).or_default().insert(version, kind);
        state.installed_version = state.installed_version.max(version);
        Ok(())
    }

    pub async fn remove_shard(&self, shard: u64, version: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(versions) = state.shards.get_mut(&shard) {
            versions.remove(&version);
            if versions.is_empty() {
                state.shards.remove(&shard);
            }
        }
        Ok(())
    }

    pub async fn local_shards(&self) -> BTreeSet<u64> {
        self.state.lock().await.owned_shards()
    }

    pub async fn installed_version(&self) -> i64 {
        self.state.lock().await.installed_version
    }

    // ---- repos -----------------------------------------------------------

    pub async fn create_repo(&self, repo_info: &RepoInfo, version: i64) -> Result<()> {
        if repo_info.repo.name.is_empty() {
            return Err(StrataError::InvalidArgument(
                "repo name cannot be empty".to_string(),
            ));
        }
        {
            let mut state = self.state.lock().await;
            state.check_write_version(version)?;
            if state.repos.contains_key(&repo_info.repo.name) {
                return Err(StrataError::AlreadyExists(format!(
                    "repo {}",
                    repo_info.repo.name
                )));
            }
            state
                .repos
                .insert(repo_info.repo.name.clone(), repo_info.clone());
        }
        fs::create_dir_all(self.diffs.repo_dir(&repo_info.repo.name)).await?;
        Ok(())
    }

    /// Idempotent repo registration, used when diffs arrive from a peer
    /// for a repo this node has not seen yet.
    pub async fn ensure_repo(&self, repo_info: &RepoInfo) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.repos.contains_key(&repo_info.repo.name) {
                return Ok(());
            }
            state
                .repos
                .insert(repo_info.repo.name.clone(), repo_info.clone());
        }
        fs::create_dir_all(self.diffs.repo_dir(&repo_info.repo.name)).await?;
        Ok(())
    }

    pub async fn inspect_repo(&self, repo: &Repo) -> Result<RepoInfo> {
        let state = self.state.lock().await;
        state
            .repos
            .get(&repo.name)
            .cloned()
            .ok_or_else(|| StrataError::NotFound(format!("repo {}", repo.name)))
    }

    pub async fn list_repo(&self) -> Result<Vec<RepoInfo>> {
        let state = self.state.lock().await;
        Ok(state.repos.values().cloned().collect())
    }

    pub async fn delete_repo(&self, repo: &Repo, version: i64) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.check_write_version(version)?;
            if state.repos.remove(&repo.name).is_none() {
                return Err(StrataError::NotFound(format!("repo {}", repo.name)));
            }
            state
                .open_commits
                .retain(|(repo_name, _), _| repo_name != &repo.name);
        }
        let dir = self.diffs.repo_dir(&repo.name);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    // ---- commits ---------------------------------------------------------

    pub async fn start_commit(
        &self,
        parent: Option<Commit>,
        commit: Commit,
        started: DateTime<Utc>,
        version: i64,
    ) -> Result<()> {
        if let Some(parent) = &parent {
            if parent.repo != commit.repo {
                return Err(StrataError::InvalidArgument(
                    "parent commit belongs to a different repo".to_string(),
                ));
            }
        }
        let commit_exists = fs::try_exists(
            self.diffs
                .commit_dir(&commit.repo.name, &commit.id),
        )
        .await?;
        let parent_on_disk = match &parent {
            Some(parent) => {
                fs::try_exists(self.diffs.commit_dir(&parent.repo.name, &parent.id)).await?
            }
            None => true,
        };
        let mut state = self.state.lock().await;
        state.check_write_version(version)?;
        if !state.repos.contains_key(&commit.repo.name) {
            return Err(StrataError::NotFound(format!("repo {}", commit.repo.name)));
        }
        let key = (commit.repo.name.clone(), commit.id.clone());
        if state.open_commits.contains_key(&key) || commit_exists {
            return Err(StrataError::AlreadyExists(format!(
                "commit {}/{}",
                commit.repo.name, commit.id
            )));
        }
        if let Some(parent) = &parent {
            let parent_key = (parent.repo.name.clone(), parent.id.clone());
            if !parent_on_disk && !state.open_commits.contains_key(&parent_key) {
                return Err(StrataError::NotFound(format!(
                    "parent commit {}/{}",
                    parent.repo.name, parent.id
                )));
            }
        }
        let mut open = OpenCommit {
            parent: parent.clone(),
            started,
            diffs: BTreeMap::new(),
        };
        for shard in state.master_shards() {
            open.diffs.insert(
                shard,
                DiffInfo {
                    diff: Diff {
                        commit: commit.clone(),
                        shard,
                    },
                    parent: parent.clone(),
                    appends: BTreeMap::new(),
                    size_bytes: 0,
                    started,
                    finished: None,
                },
            );
        }
        state.open_commits.insert(key, open);
        Ok(())
    }

    pub async fn finish_commit(
        &self,
        commit: &Commit,
        finished: DateTime<Utc>,
        version: i64,
    ) -> Result<()> {
        let open = {
            let mut state = self.state.lock().await;
            state.check_write_version(version)?;
            let key = (commit.repo.name.clone(), commit.id.clone());
            state.open_commits.remove(&key)
        };
        let Some(open) = open else {
            if fs::try_exists(self.diffs.commit_dir(&commit.repo.name, &commit.id)).await? {
                return Err(StrataError::InvalidArgument(format!(
                    "commit {}/{} is already finished",
                    commit.repo.name, commit.id
                )));
            }
            return Err(StrataError::NotFound(format!(
                "commit {}/{}",
                commit.repo.name, commit.id
            )));
        };
        for (_, mut diff) in open.diffs {
            diff.finished = Some(finished);
            self.diffs.create_diff(&diff).await?;
        }
        Ok(())
    }

    pub async fn inspect_commit(&self, commit: &Commit) -> Result<CommitInfo> {
        {
            let state = self.state.lock().await;
            let key = (commit.repo.name.clone(), commit.id.clone());
            if let Some(open) = state.open_commits.get(&key) {
                return Ok(CommitInfo {
                    commit: commit.clone(),
                    parent: open.parent.clone(),
                    commit_type: CommitType::Write,
                    started: open.started,
                    finished: None,
                    size_bytes: open.diffs.values().map(|diff| diff.size_bytes).sum(),
                });
            }
        }
        self.read_disk_commit_info(commit).await
    }

    async fn read_disk_commit_info(&self, commit: &Commit) -> Result<CommitInfo> {
        let dir = self.diffs.commit_dir(&commit.repo.name, &commit.id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StrataError::NotFound(format!(
                    "commit {}/{}",
                    commit.repo.name, commit.id
                )));
            }
            Err(err) => return Err(err.into()),
        };
        let mut info: Option<CommitInfo> = None;
        let mut size_bytes = 0;
        while let Some(entry) = entries.next_entry().await? {
            let Some(shard) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            else {
                continue;
            };
            let diff = self
                .diffs
                .inspect_diff(&Diff {
                    commit: commit.clone(),
                    shard,
                })
                .await?;
            size_bytes += diff.size_bytes;
            if info.is_none() {
                info = Some(diff.commit_info());
            }
        }
        match info {
            Some(mut info) => {
                info.size_bytes = size_bytes;
                Ok(info)
            }
            None => Err(StrataError::NotFound(format!(
                "commit {}/{}",
                commit.repo.name, commit.id
            ))),
        }
    }

    /// Commits of a repo, oldest first. With `shard` set, only the
    /// sequence recorded by that shard's diffs; this is the authoritative
    /// order reconciliation compares against.
    pub async fn list_commit(&self, repo: &Repo, shard: Option<u64>) -> Result<Vec<CommitInfo>> {
        {
            let state = self.state.lock().await;
            if !state.repos.contains_key(&repo.name) {
                return Err(StrataError::NotFound(format!("repo {}", repo.name)));
            }
        }
        let mut result = Vec::new();
        let repo_dir = self.diffs.repo_dir(&repo.name);
        if fs::try_exists(&repo_dir).await? {
            let mut entries = fs::read_dir(&repo_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let Some(commit_id) = entry.file_name().to_str().map(String::from) else {
                    continue;
                };
                let commit = Commit::new(repo.name.clone(), commit_id);
                match shard {
                    Some(shard) => {
                        let diff = Diff {
                            commit: commit.clone(),
                            shard,
                        };
                        if self.diffs.has_diff(&diff).await? {
                            result.push(self.diffs.inspect_diff(&diff).await?.commit_info());
                        }
                    }
                    None => match self.read_disk_commit_info(&commit).await {
                        Ok(info) => result.push(info),
                        Err(StrataError::NotFound(_)) => continue,
                        Err(err) => return Err(err),
                    },
                }
            }
        }
        if shard.is_none() {
            let state = self.state.lock().await;
            for ((repo_name, commit_id), open) in &state.open_commits {
                if repo_name != &repo.name {
                    continue;
                }
                result.push(CommitInfo {
                    commit: Commit::new(repo_name.clone(), commit_id.clone()),
                    parent: open.parent.clone(),
                    commit_type: CommitType::Write,
                    started: open.started,
                    finished: None,
                    size_bytes: open.diffs.values().map(|diff| diff.size_bytes).sum(),
                });
            }
        }
        result.sort_by(|a, b| {
            a.started
                .cmp(&b.started)
                .then_with(|| a.commit.id.cmp(&b.commit.id))
        });
        Ok(result)
    }

    pub async fn delete_commit(&self, commit: &Commit, version: i64) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.check_write_version(version)?;
            let key = (commit.repo.name.clone(), commit.id.clone());
            if state.open_commits.remove(&key).is_some() {
                return Ok(());
            }
        }
        let dir = self.diffs.commit_dir(&commit.repo.name, &commit.id);
        if !fs::try_exists(&dir).await? {
            return Err(StrataError::NotFound(format!(
                "commit {}/{}",
                commit.repo.name, commit.id
            )));
        }
        fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    // ---- files -----------------------------------------------------------

    pub async fn put_file<S>(&self, file: &File, version: i64, stream: S) -> Result<()>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        validate_path(&file.path)?;
        let shard = self.sharder.shard_for_file(file);
        let parent = {
            let state = self.state.lock().await;
            state.check_write_version(version)?;
            if !state.is_master(shard) {
                return Err(StrataError::InvalidArgument(format!(
                    "node is not master for shard {}",
                    shard
                )));
            }
            self.open_commit_parent(&state, &file.commit).await?
        };

        // chunk outside the state lock so concurrent writers only contend
        // on the append bookkeeping
        let refs = self.blocks.put_blocks(stream).await?;
        let added: u64 = refs.iter().map(BlockRef::size_bytes).sum();

        // place each block on its block-shard holder so any reader can
        // resolve it; the local copy doubles as a cache
        for block_ref in &refs {
            if block_ref.size_bytes() == 0 {
                continue;
            }
            let data = self
                .blocks
                .get_block(&block_ref.block, 0, block_ref.size_bytes())
                .await?;
            self.peers.store(&block_ref.block, data, version).await?;
        }

        let last_refs = self
            .ancestry_last_refs(&file.path, shard, parent.as_ref())
            .await?;

        let mut state = self.state.lock().await;
        let key = (file.commit.repo.name.clone(), file.commit.id.clone());
        let Some(open) = state.open_commits.get_mut(&key) else {
            return Err(StrataError::NotFound(format!(
                "commit {}/{}",
                file.commit.repo.name, file.commit.id
            )));
        };
        let diff = open_shard_diff(open, &file.commit, shard);
        let entry = diff
            .appends
            .entry(file.path.clone())
            .or_insert_with(|| Append::regular(last_refs.get(&file.path).cloned().flatten()));
        if entry.file_type == FileType::Dir {
            return Err(StrataError::InvalidArgument(format!(
                "{} is a directory",
                file.path
            )));
        }
        entry.block_refs.extend(refs);
        diff.size_bytes += added;
        register_ancestors(diff, &file.path, &last_refs);
        Ok(())
    }

    /// Convenience wrapper for callers holding the whole value in memory.
    pub async fn put_file_bytes(&self, file: &File, version: i64, data: Bytes) -> Result<()> {
        self.put_file(file, version, futures::stream::iter(vec![Ok(data)]))
            .await
    }

    /// Record a directory. Fanned out cluster-wide; only the master of the
    /// directory's own shard records it.
    pub async fn make_directory(&self, file: &File, version: i64) -> Result<()> {
        validate_path(&file.path)?;
        let shard = self.sharder.shard_for_file(file);
        let parent = {
            let state = self.state.lock().await;
            state.check_write_version(version)?;
            if !state.is_master(shard) {
                return Ok(());
            }
            self.open_commit_parent(&state, &file.commit).await?
        };
        let last_refs = self
            .ancestry_last_refs(&file.path, shard, parent.as_ref())
            .await?;
        let mut state = self.state.lock().await;
        let key = (file.commit.repo.name.clone(), file.commit.id.clone());
        let Some(open) = state.open_commits.get_mut(&key) else {
            return Err(StrataError::NotFound(format!(
                "commit {}/{}",
                file.commit.repo.name, file.commit.id
            )));
        };
        let diff = open_shard_diff(open, &file.commit, shard);
        let entry = diff
            .appends
            .entry(file.path.clone())
            .or_insert_with(|| Append::dir(last_refs.get(&file.path).cloned().flatten()));
        if entry.file_type != FileType::Dir {
            return Err(StrataError::InvalidArgument(format!(
                "{} is a regular file",
                file.path
            )));
        }
        register_ancestors(diff, &file.path, &last_refs);
        Ok(())
    }

    pub async fn delete_file(&self, file: &File, version: i64) -> Result<()> {
        validate_path(&file.path)?;
        let shard = self.sharder.shard_for_file(file);
        let parent = {
            let state = self.state.lock().await;
            state.check_write_version(version)?;
            if !state.is_master(shard) {
                return Err(StrataError::InvalidArgument(format!(
                    "node is not master for shard {}",
                    shard
                )));
            }
            self.open_commit_parent(&state, &file.commit).await?
        };
        let appends = self.lineage_appends(file, shard).await?;
        if !file_exists(&appends) {
            return Err(StrataError::NotFound(format!("file {}", file.path)));
        }
        let last_ref = {
            let mut cursor = parent;
            self.find_last_ref(&mut cursor, &file.path, shard).await?
        };
        let mut state = self.state.lock().await;
        let key = (file.commit.repo.name.clone(), file.commit.id.clone());
        let Some(open) = state.open_commits.get_mut(&key) else {
            return Err(StrataError::NotFound(format!(
                "commit {}/{}",
                file.commit.repo.name, file.commit.id
            )));
        };
        let diff = open_shard_diff(open, &file.commit, shard);
        diff.appends
            .insert(file.path.clone(), Append::tombstone(last_ref));
        Ok(())
    }

    /// Resolve a file's bytes: concatenate its lineage of block refs in
    /// commit order, then window by `offset` and `size`.
    pub async fn get_file(
        &self,
        file: &File,
        offset: u64,
        size: u64,
        shard: Option<u64>,
        version: i64,
    ) -> Result<Bytes> {
        validate_path(&file.path)?;
        if file.path.is_empty() {
            return Err(StrataError::InvalidArgument("path is a directory".to_string()));
        }
        let shard = shard.unwrap_or_else(|| self.sharder.shard_for_file(file));
        {
            let state = self.state.lock().await;
            if !state.owns(shard) {
                return Err(StrataError::InvalidArgument(format!(
                    "shard {} is not held by this node",
                    shard
                )));
            }
        }
        let appends = self.lineage_appends(file, shard).await?;
        if !file_exists(&appends) {
            return Err(StrataError::NotFound(format!("file {}", file.path)));
        }
        if appends
            .iter()
            .any(|append| append.file_type == FileType::Dir)
        {
            return Err(StrataError::InvalidArgument(format!(
                "{} is a directory",
                file.path
            )));
        }

        let mut out = Vec::new();
        let mut skip = offset;
        let mut remaining = size;
        for block_ref in appends.iter().flat_map(|append| &append.block_refs) {
            if remaining == 0 {
                break;
            }
            let len = block_ref.size_bytes();
            if skip >= len {
                skip -= len;
                continue;
            }
            let start = block_ref.range.lower + skip;
            let take = (len - skip).min(remaining);
            skip = 0;
            let data = if self.blocks.has_block(&block_ref.block).await? {
                self.blocks.get_block(&block_ref.block, start, take).await?
            } else {
                self.peers
                    .fetch(&block_ref.block, start, take, version)
                    .await?
            };
            remaining = remaining.saturating_sub(data.len() as u64);
            out.extend_from_slice(&data);
        }
        Ok(Bytes::from(out))
    }

    pub async fn inspect_file(&self, file: &File, shard: Option<u64>) -> Result<FileInfo> {
        validate_path(&file.path)?;
        let shards = match shard {
            Some(shard) => [shard].into(),
            None => self.local_shards().await,
        };
        let mut found = false;
        let mut is_dir = file.path.is_empty();
        let mut size_bytes = 0;
        let mut children = BTreeSet::new();
        for shard in shards {
            let appends = match self.lineage_appends(file, shard).await {
                Ok(appends) => appends,
                Err(StrataError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            if !file_exists(&appends) {
                continue;
            }
            found = true;
            for append in appends {
                if append.file_type == FileType::Dir {
                    is_dir = true;
                    children.extend(append.children);
                } else {
                    size_bytes += append
                        .block_refs
                        .iter()
                        .map(BlockRef::size_bytes)
                        .sum::<u64>();
                }
            }
        }
        if !found && !file.path.is_empty() {
            return Err(StrataError::NotFound(format!("file {}", file.path)));
        }
        Ok(FileInfo {
            file: file.clone(),
            file_type: if is_dir { FileType::Dir } else { FileType::Regular },
            size_bytes: if is_dir { 0 } else { size_bytes },
            children,
        })
    }

    /// List a directory: the union of `children` recorded across the
    /// lineage on every shard this node holds. Children whose own appends
    /// live on other nodes are reported by those nodes; the gateway merges.
    pub async fn list_file(&self, file: &File, shard: Option<u64>) -> Result<Vec<FileInfo>> {
        validate_path(&file.path)?;
        let shards = match shard {
            Some(shard) => [shard].into(),
            None => self.local_shards().await,
        };
        let mut child_shards: BTreeMap<String, u64> = BTreeMap::new();
        let mut is_dir = file.path.is_empty();
        let mut is_file = false;
        for shard in shards {
            let appends = match self.lineage_appends(file, shard).await {
                Ok(appends) => appends,
                Err(StrataError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            if !file_exists(&appends) {
                continue;
            }
            for append in appends {
                if append.file_type == FileType::Dir {
                    is_dir = true;
                    for child in append.children {
                        let child_path = if file.path.is_empty() {
                            child
                        } else {
                            format!("{}/{}", file.path, child)
                        };
                        child_shards.entry(child_path).or_insert(shard);
                    }
                } else if !append.tombstone || !append.block_refs.is_empty() {
                    is_file = true;
                }
            }
        }
        if is_file && !is_dir {
            return Ok(vec![self.inspect_file(file, shard).await?]);
        }
        if !is_dir {
            return Err(StrataError::NotFound(format!("file {}", file.path)));
        }
        let mut result = Vec::new();
        for (child_path, child_shard) in child_shards {
            let child = File {
                commit: file.commit.clone(),
                path: child_path,
            };
            match self.inspect_file(&child, Some(child_shard)).await {
                Ok(info) => result.push(info),
                // deleted children stay listed in old `children` sets
                Err(StrataError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(result)
    }

    // ---- diff replication ------------------------------------------------

    pub async fn pull_diff(&self, diff: &Diff) -> Result<Vec<u8>> {
        {
            let state = self.state.lock().await;
            let key = (diff.commit.repo.name.clone(), diff.commit.id.clone());
            if state.open_commits.contains_key(&key) {
                return Err(StrataError::InvalidArgument(format!(
                    "commit {}/{} is not finished",
                    diff.commit.repo.name, diff.commit.id
                )));
            }
        }
        self.diffs.diff_bytes(diff).await
    }

    /// Apply a diff record pulled from a peer, byte for byte.
    pub async fn push_diff(&self, diff: &Diff, data: &[u8]) -> Result<()> {
        let info: DiffInfo = bincode::deserialize(data)?;
        if info.diff != *diff {
            return Err(StrataError::InvalidArgument(format!(
                "diff record is for {}/{}/{}",
                info.diff.commit.repo.name, info.diff.commit.id, info.diff.shard
            )));
        }
        self.ensure_repo(&RepoInfo {
            repo: diff.commit.repo.clone(),
            created: info.started,
        })
        .await?;
        self.diffs.put_diff_bytes(diff, data).await
    }

    pub async fn list_diff(&self, shard: u64) -> Result<Vec<DiffInfo>> {
        self.diffs.list_diff(shard).await
    }

    pub async fn inspect_diff(&self, diff: &Diff) -> Result<DiffInfo> {
        self.diffs.inspect_diff(diff).await
    }

    pub async fn delete_diff(&self, diff: &Diff) -> Result<()> {
        self.diffs.delete_diff(diff).await
    }

    // ---- lineage ---------------------------------------------------------

    /// The commit's diff for one shard: open state first, then disk.
    async fn diff_for(&self, commit: &Commit, shard: u64) -> Result<Option<DiffInfo>> {
        {
            let state = self.state.lock().await;
            let key = (commit.repo.name.clone(), commit.id.clone());
            if let Some(open) = state.open_commits.get(&key) {
                if let Some(diff) = open.diffs.get(&shard) {
                    return Ok(Some(diff.clone()));
                }
                // an open commit with no appends on this shard yet still
                // links the lineage through its parent
                return Ok(Some(DiffInfo {
                    diff: Diff {
                        commit: commit.clone(),
                        shard,
                    },
                    parent: open.parent.clone(),
                    appends: BTreeMap::new(),
                    size_bytes: 0,
                    started: open.started,
                    finished: None,
                }));
            }
        }
        let diff = Diff {
            commit: commit.clone(),
            shard,
        };
        if self.diffs.has_diff(&diff).await? {
            return Ok(Some(self.diffs.inspect_diff(&diff).await?));
        }
        Ok(None)
    }

    /// Appends recorded for a path along the commit lineage, oldest first,
    /// truncated at the most recent tombstone. Empty means the path never
    /// existed (or was deleted).
    async fn lineage_appends(&self, file: &File, shard: u64) -> Result<Vec<Append>> {
        let mut collected = Vec::new();
        let mut cursor = Some(file.commit.clone());
        while let Some(commit) = cursor.take() {
            let Some(diff) = self.diff_for(&commit, shard).await? else {
                return Err(StrataError::NotFound(format!(
                    "commit {}/{} is not available for shard {}",
                    commit.repo.name, commit.id, shard
                )));
            };
            match diff.appends.get(&file.path) {
                Some(append) => {
                    let stop = append.tombstone;
                    collected.push(append.clone());
                    if stop {
                        break;
                    }
                    cursor = append.last_ref.clone();
                }
                None => cursor = diff.parent.clone(),
            }
        }
        collected.reverse();
        // a tombstone clears everything before it; its own refs (if any)
        // start the path over
        if let Some(pos) = collected.iter().rposition(|append| append.tombstone) {
            collected.drain(..pos);
        }
        Ok(collected)
    }

    /// Most recent ancestor commit (starting at `cursor`) whose diff
    /// touches `path`.
    async fn find_last_ref(
        &self,
        cursor: &mut Option<Commit>,
        path: &str,
        shard: u64,
    ) -> Result<Option<Commit>> {
        while let Some(commit) = cursor.take() {
            let Some(diff) = self.diff_for(&commit, shard).await? else {
                return Ok(None);
            };
            if diff.appends.contains_key(path) {
                return Ok(Some(commit));
            }
            *cursor = diff.parent.clone();
        }
        Ok(None)
    }

    /// `last_ref` for a path and each of its ancestors, computed before
    /// taking the state lock.
    async fn ancestry_last_refs(
        &self,
        path: &str,
        shard: u64,
        parent: Option<&Commit>,
    ) -> Result<BTreeMap<String, Option<Commit>>> {
        let mut result = BTreeMap::new();
        let mut current = path.to_string();
        loop {
            let mut cursor = parent.cloned();
            let last_ref = self.find_last_ref(&mut cursor, &current, shard).await?;
            result.insert(current.clone(), last_ref);
            match parent_path(&current) {
                Some(parent) => current = parent.to_string(),
                None => break,
            }
        }
        Ok(result)
    }

    /// Parent pointer of an open commit, or the reason writes to it fail.
    async fn open_commit_parent(
        &self,
        state: &DriverState,
        commit: &Commit,
    ) -> Result<Option<Commit>> {
        let key = (commit.repo.name.clone(), commit.id.clone());
        if let Some(open) = state.open_commits.get(&key) {
            return Ok(open.parent.clone());
        }
        if fs::try_exists(self.diffs.commit_dir(&commit.repo.name, &commit.id)).await? {
            return Err(StrataError::InvalidArgument(format!(
                "commit {}/{} is finished and immutable",
                commit.repo.name, commit.id
            )));
        }
        Err(StrataError::NotFound(format!(
            "commit {}/{}",
            commit.repo.name, commit.id
        )))
    }
}

fn open_shard_diff<'a>(open: &'a mut OpenCommit, commit: &Commit, shard: u64) -> &'a mut DiffInfo {
    let parent = open.parent.clone();
    let started = open.started;
    open.diffs.entry(shard).or_insert_with(|| DiffInfo {
        diff: Diff {
            commit: commit.clone(),
            shard,
        },
        parent,
        appends: BTreeMap::new(),
        size_bytes: 0,
        started,
        finished: None,
    })
}

/// Register `path` in each ancestor directory's `children` within the
/// same diff, up to the root.
fn register_ancestors(
    diff: &mut DiffInfo,
    path: &str,
    last_refs: &BTreeMap<String, Option<Commit>>,
) {
    let mut current = path.to_string();
    while let Some(parent) = parent_path(&current).map(str::to_string) {
        let child = base_name(&current).to_string();
        let entry = diff
            .appends
            .entry(parent.clone())
            .or_insert_with(|| Append::dir(last_refs.get(&parent).cloned().flatten()));
        entry.file_type = FileType::Dir;
        entry.children.insert(child);
        current = parent;
    }
}

/// A trimmed lineage still containing only an empty tombstone means the
/// path does not exist.
fn file_exists(appends: &[Append]) -> bool {
    appends
        .iter()
        .any(|append| !append.tombstone || !append.block_refs.is_empty())
}

/// Leading slashes are rejected: `a` and `/a` hash to different shards
/// but collapse to the same key downstream, which would split one logical
/// path across two shards.
fn validate_path(path: &str) -> Result<()> {
    if path.starts_with('/') {
        return Err(StrataError::InvalidArgument(format!(
            "leading slash in path: {}",
            path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_driver() -> (tempfile::TempDir, Arc<Driver>) {
        let dir = tempfile::tempdir().unwrap();
        let blocks = Arc::new(BlockStore::new(dir.path(), 8 * 1024 * 1024).unwrap());
        let diffs = Arc::new(DiffStore::new(dir.path()).unwrap());
        let peers = Arc::new(LocalBlockPeers::new(blocks.clone()));
        let driver =
            Arc::new(Driver::new(Sharder::new(32, 32), blocks, diffs, peers).unwrap());
        for shard in 0..32 {
            driver
                .add_shard(shard, 0, ShardRoleKind::Master)
                .await
                .unwrap();
        }
        (dir, driver)
    }

    async fn create_repo(driver: &Driver, name: &str) {
        driver
            .create_repo(
                &RepoInfo {
                    repo: Repo::new(name),
                    created: Utc::now(),
                },
                0,
            )
            .await
            .unwrap();
    }

    async fn start(driver: &Driver, repo: &str, id: &str, parent: Option<&str>) {
        driver
            .start_commit(
                parent.map(|parent| Commit::new(repo, parent)),
                Commit::new(repo, id),
                Utc::now(),
                0,
            )
            .await
            .unwrap();
    }

    async fn finish(driver: &Driver, repo: &str, id: &str) {
        driver
            .finish_commit(&Commit::new(repo, id), Utc::now(), 0)
            .await
            .unwrap();
    }

    async fn put(driver: &Driver, repo: &str, id: &str, path: &str, data: &[u8]) {
        driver
            .put_file_bytes(&File::new(repo, id, path), 0, Bytes::copy_from_slice(data))
            .await
            .unwrap();
    }

    async fn get(driver: &Driver, repo: &str, id: &str, path: &str) -> Result<Bytes> {
        driver
            .get_file(&File::new(repo, id, path), 0, u64::MAX, None, 0)
            .await
    }

    #[tokio::test]
    async fn single_node_write_read() {
        let (_dir, driver) = test_driver().await;
        create_repo(&driver, "r").await;
        start(&driver, "r", "c1", None).await;
        put(&driver, "r", "c1", "a.txt", b"hello\nworld\n").await;
        finish(&driver, "r", "c1").await;

        let data = get(&driver, "r", "c1", "a.txt").await.unwrap();
        assert_eq!(&data[..], b"hello\nworld\n");

        let info = driver
            .inspect_file(&File::new("r", "c1", "a.txt"), None)
            .await
            .unwrap();
        assert_eq!(info.file_type, FileType::Regular);
        assert_eq!(info.size_bytes, 12);
    }

    #[tokio::test]
    async fn lineage_concatenates_across_commits() {
        let (_dir, driver) = test_driver().await;
        create_repo(&driver, "r").await;
        start(&driver, "r", "c1", None).await;
        put(&driver, "r", "c1", "a.txt", b"hello\n").await;
        finish(&driver, "r", "c1").await;
        start(&driver, "r", "c2", Some("c1")).await;
        put(&driver, "r", "c2", "a.txt", b"world\n").await;
        finish(&driver, "r", "c2").await;

        let child = get(&driver, "r", "c2", "a.txt").await.unwrap();
        assert_eq!(&child[..], b"hello\nworld\n");
        // the finished parent is untouched
        let parent = get(&driver, "r", "c1", "a.txt").await.unwrap();
        assert_eq!(&parent[..], b"hello\n");

        let info = driver
            .inspect_file(&File::new("r", "c2", "a.txt"), None)
            .await
            .unwrap();
        assert_eq!(info.size_bytes, 12);
    }

    #[tokio::test]
    async fn offset_and_size_window_reads() {
        let (_dir, driver) = test_driver().await;
        create_repo(&driver, "r").await;
        start(&driver, "r", "c1", None).await;
        put(&driver, "r", "c1", "a.txt", b"hello\nworld\n").await;
        finish(&driver, "r", "c1").await;

        let file = File::new("r", "c1", "a.txt");
        let mid = driver.get_file(&file, 6, 5, None, 0).await.unwrap();
        assert_eq!(&mid[..], b"world");
        let tail = driver.get_file(&file, 6, u64::MAX, None, 0).await.unwrap();
        assert_eq!(&tail[..], b"world\n");
    }

    #[tokio::test]
    async fn finished_commits_are_immutable() {
        let (_dir, driver) = test_driver().await;
        create_repo(&driver, "r").await;
        start(&driver, "r", "c1", None).await;
        finish(&driver, "r", "c1").await;

        let err = driver
            .put_file_bytes(&File::new("r", "c1", "a.txt"), 0, Bytes::from_static(b"x\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::InvalidArgument(_)));

        let err = driver
            .finish_commit(&Commit::new("r", "c1"), Utc::now(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn leading_slash_is_rejected() {
        let (_dir, driver) = test_driver().await;
        create_repo(&driver, "r").await;
        start(&driver, "r", "c1", None).await;

        let err = driver
            .put_file_bytes(&File::new("r", "c1", "/a.txt"), 0, Bytes::from_static(b"x\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn delete_tombstones_and_recreate_starts_over() {
        let (_dir, driver) = test_driver().await;
        create_repo(&driver, "r").await;
        start(&driver, "r", "c1", None).await;
        put(&driver, "r", "c1", "a.txt", b"old\n").await;
        finish(&driver, "r", "c1").await;

        start(&driver, "r", "c2", Some("c1")).await;
        driver
            .delete_file(&File::new("r", "c2", "a.txt"), 0)
            .await
            .unwrap();
        finish(&driver, "r", "c2").await;

        let err = get(&driver, "r", "c2", "a.txt").await.unwrap_err();
        assert!(matches!(err, StrataError::NotFound(_)));
        // ancestors still see the data
        let old = get(&driver, "r", "c1", "a.txt").await.unwrap();
        assert_eq!(&old[..], b"old\n");

        start(&driver, "r", "c3", Some("c2")).await;
        put(&driver, "r", "c3", "a.txt", b"new\n").await;
        finish(&driver, "r", "c3").await;
        let recreated = get(&driver, "r", "c3", "a.txt").await.unwrap();
        assert_eq!(&recreated[..], b"new\n");
    }

    #[tokio::test]
    async fn deleting_missing_file_is_not_found() {
        let (_dir, driver) = test_driver().await;
        create_repo(&driver, "r").await;
        start(&driver, "r", "c1", None).await;

        let err = driver
            .delete_file(&File::new("r", "c1", "nope.txt"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::NotFound(_)));
    }

    #[tokio::test]
    async fn directories_union_across_lineage() {
        let (_dir, driver) = test_driver().await;
        create_repo(&driver, "r").await;
        start(&driver, "r", "c1", None).await;
        put(&driver, "r", "c1", "a/b.txt", b"one\n").await;
        finish(&driver, "r", "c1").await;
        start(&driver, "r", "c2", Some("c1")).await;
        put(&driver, "r", "c2", "a/c.txt", b"two\n").await;
        finish(&driver, "r", "c2").await;

        let info = driver
            .inspect_file(&File::new("r", "c2", "a"), None)
            .await
            .unwrap();
        assert_eq!(info.file_type, FileType::Dir);
        assert_eq!(info.size_bytes, 0);
        assert!(info.children.contains("b.txt"));
        assert!(info.children.contains("c.txt"));

        let listed = driver
            .list_file(&File::new("r", "c2", "a"), None)
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|info| info.file_type == FileType::Regular));

        let root = driver
            .list_file(&File::new("r", "c2", ""), None)
            .await
            .unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].file.path, "a");
        assert_eq!(root[0].file_type, FileType::Dir);
    }

    #[tokio::test]
    async fn make_directory_records_empty_dir() {
        let (_dir, driver) = test_driver().await;
        create_repo(&driver, "r").await;
        start(&driver, "r", "c1", None).await;
        driver
            .make_directory(&File::new("r", "c1", "d"), 0)
            .await
            .unwrap();
        finish(&driver, "r", "c1").await;

        let info = driver
            .inspect_file(&File::new("r", "c1", "d"), None)
            .await
            .unwrap();
        assert_eq!(info.file_type, FileType::Dir);
        assert!(info.children.is_empty());

        let err = get(&driver, "r", "c1", "d").await.unwrap_err();
        assert!(matches!(err, StrataError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn add_shard_is_idempotent() {
        let (_dir, driver) = test_driver().await;
        let before = driver.local_shards().await;
        driver
            .add_shard(3, 0, ShardRoleKind::Master)
            .await
            .unwrap();
        driver
            .add_shard(3, 0, ShardRoleKind::Master)
            .await
            .unwrap();
        assert_eq!(driver.local_shards().await, before);
        assert_eq!(driver.installed_version().await, 0);
    }

    #[tokio::test]
    async fn remove_shard_honors_version_references() {
        let (_dir, driver) = test_driver().await;
        driver
            .add_shard(40, 0, ShardRoleKind::Replica)
            .await
            .unwrap();
        driver
            .add_shard(40, 1, ShardRoleKind::Master)
            .await
            .unwrap();

        driver.remove_shard(40, 0).await.unwrap();
        assert!(driver.local_shards().await.contains(&40));
        driver.remove_shard(40, 1).await.unwrap();
        assert!(!driver.local_shards().await.contains(&40));
    }

    #[tokio::test]
    async fn stale_route_version_is_rejected() {
        let (_dir, driver) = test_driver().await;
        create_repo(&driver, "r").await;
        start(&driver, "r", "c1", None).await;
        for shard in 0..32 {
            driver
                .add_shard(shard, 1, ShardRoleKind::Master)
                .await
                .unwrap();
        }

        let err = driver
            .put_file_bytes(&File::new("r", "c1", "a.txt"), 0, Bytes::from_static(b"x\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::InvalidArgument(_)));

        // the same write at the current version goes through
        driver
            .put_file_bytes(&File::new("r", "c1", "a.txt"), 1, Bytes::from_static(b"x\n"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn commit_bookkeeping() {
        let (_dir, driver) = test_driver().await;
        create_repo(&driver, "r").await;

        let err = driver
            .start_commit(None, Commit::new("missing", "c1"), Utc::now(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::NotFound(_)));

        start(&driver, "r", "c1", None).await;
        let err = driver
            .start_commit(None, Commit::new("r", "c1"), Utc::now(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::AlreadyExists(_)));

        let err = driver
            .start_commit(
                Some(Commit::new("r", "ghost")),
                Commit::new("r", "c2"),
                Utc::now(),
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::NotFound(_)));

        let open = driver.inspect_commit(&Commit::new("r", "c1")).await.unwrap();
        assert_eq!(open.commit_type, CommitType::Write);
        assert!(open.finished.is_none());

        put(&driver, "r", "c1", "a.txt", b"hello\nworld\n").await;
        finish(&driver, "r", "c1").await;

        let read = driver.inspect_commit(&Commit::new("r", "c1")).await.unwrap();
        assert_eq!(read.commit_type, CommitType::Read);
        assert!(read.finished.is_some());
        assert_eq!(read.size_bytes, 12);

        start(&driver, "r", "c2", Some("c1")).await;
        let commits = driver.list_commit(&Repo::new("r"), None).await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].commit.id, "c1");
        assert_eq!(commits[1].commit.id, "c2");

        driver
            .delete_commit(&Commit::new("r", "c2"), 0)
            .await
            .unwrap();
        let commits = driver.list_commit(&Repo::new("r"), None).await.unwrap();
        assert_eq!(commits.len(), 1);
    }

    #[tokio::test]
    async fn repo_bookkeeping() {
        let (_dir, driver) = test_driver().await;
        create_repo(&driver, "r").await;

        let err = driver
            .create_repo(
                &RepoInfo {
                    repo: Repo::new("r"),
                    created: Utc::now(),
                },
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::AlreadyExists(_)));

        let listed = driver.list_repo().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].repo.name, "r");

        driver.delete_repo(&Repo::new("r"), 0).await.unwrap();
        let err = driver.inspect_repo(&Repo::new("r")).await.unwrap_err();
        assert!(matches!(err, StrataError::NotFound(_)));
    }

    #[tokio::test]
    async fn pull_push_diff_round_trip() {
        let (_dir, driver) = test_driver().await;
        create_repo(&driver, "r").await;
        start(&driver, "r", "c1", None).await;
        put(&driver, "r", "c1", "a.txt", b"hello\nworld\n").await;

        let shard = driver.sharder().shard_for_file(&File::new("r", "c1", "a.txt"));
        let diff = Diff {
            commit: Commit::new("r", "c1"),
            shard,
        };
        // open commits cannot be pulled
        let err = driver.pull_diff(&diff).await.unwrap_err();
        assert!(matches!(err, StrataError::InvalidArgument(_)));

        finish(&driver, "r", "c1").await;
        let data = driver.pull_diff(&diff).await.unwrap();

        let other_dir = tempfile::tempdir().unwrap();
        let blocks = Arc::new(BlockStore::new(other_dir.path(), 8 * 1024 * 1024).unwrap());
        let diffs = Arc::new(DiffStore::new(other_dir.path()).unwrap());
        let peers = Arc::new(LocalBlockPeers::new(blocks.clone()));
        let other =
            Driver::new(Sharder::new(32, 32), blocks, diffs, peers).unwrap();
        other.push_diff(&diff, &data).await.unwrap();

        assert_eq!(other.pull_diff(&diff).await.unwrap(), data);
        let commits = other.list_commit(&Repo::new("r"), Some(shard)).await.unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].commit.id, "c1");
    }
}
