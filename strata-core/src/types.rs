use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Commit id of the empty commit created together with its repo.
pub const INITIAL_COMMIT_ID: &str = "init";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Repo {
    pub name: String,
}

impl Repo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Commit {
    pub repo: Repo,
    pub id: String,
}

impl Commit {
    pub fn new(repo_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            repo: Repo::new(repo_name),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct File {
    pub commit: Commit,
    pub path: String,
}

impl File {
    pub fn new(
        repo_name: impl Into<String>,
        commit_id: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            commit: Commit::new(repo_name, commit_id),
            path: path.into(),
        }
    }
}

/// WRITE while the commit is open, READ once finished. READ commits are
/// immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitType {
    Write,
    Read,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub repo: Repo,
    pub created: DateTime<Utc>,
}

/// Divergence detection during replica reconciliation compares these
/// records field by field, hence the derived `PartialEq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub commit: Commit,
    pub parent: Option<Commit>,
    pub commit_type: CommitType,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
}

impl Block {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }
}

/// Half-open byte range `[lower, upper)` within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub lower: u64,
    pub upper: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub block: Block,
    pub range: ByteRange,
}

impl BlockRef {
    pub fn size_bytes(&self) -> u64 {
        self.range.upper - self.range.lower
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub block: Block,
    pub created: DateTime<Utc>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Regular,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file: File,
    pub file_type: FileType,
    pub size_bytes: u64,
    pub children: BTreeSet<String>,
}

/// The per-shard slice of a commit: the unit of storage and replication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diff {
    pub commit: Commit,
    pub shard: u64,
}

/// All appends recorded for one path in one diff.
///
/// `last_ref` points at the most recent ancestor commit that also touched
/// the path, forming a per-path linked list across the commit lineage. A
/// `tombstone` append deletes the path: lineage walks stop collecting
/// older appends once they see one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Append {
    pub block_refs: Vec<BlockRef>,
    pub children: BTreeSet<String>,
    pub file_type: FileType,
    pub last_ref: Option<Commit>,
    pub tombstone: bool,
}

impl Append {
    pub fn regular(last_ref: Option<Commit>) -> Self {
        Self {
            block_refs: Vec::new(),
            children: BTreeSet::new(),
            file_type: FileType::Regular,
            last_ref,
            tombstone: false,
        }
    }

    pub fn dir(last_ref: Option<Commit>) -> Self {
        Self {
            block_refs: Vec::new(),
            children: BTreeSet::new(),
            file_type: FileType::Dir,
            last_ref,
            tombstone: false,
        }
    }

    pub fn tombstone(last_ref: Option<Commit>) -> Self {
        Self {
            block_refs: Vec::new(),
            children: BTreeSet::new(),
            file_type: FileType::Regular,
            last_ref,
            tombstone: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffInfo {
    pub diff: Diff,
    /// Parent of the enclosing commit, denormalized for cheap traversal.
    pub parent: Option<Commit>,
    pub appends: BTreeMap<String, Append>,
    pub size_bytes: u64,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
}

impl DiffInfo {
    pub fn commit_info(&self) -> CommitInfo {
        CommitInfo {
            commit: self.diff.commit.clone(),
            parent: self.parent.clone(),
            commit_type: if self.finished.is_some() {
                CommitType::Read
            } else {
                CommitType::Write
            },
            started: self.started,
            finished: self.finished,
            size_bytes: self.size_bytes,
        }
    }
}

/// Immediate parent of a path, or `None` at the root. The root directory
/// is the empty path.
pub fn parent_path(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(idx) => Some(&path[..idx]),
        None => Some(""),
    }
}

/// Last component of a path.
pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}
