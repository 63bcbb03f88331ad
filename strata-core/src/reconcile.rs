use std::sync::Arc;

use async_trait::async_trait;

use crate::client::ClusterClient;
use crate::driver::Driver;
use crate::error::{Result, StrataError};
use crate::types::{CommitInfo, CommitType, Diff, Repo, RepoInfo};

/// A peer that can be caught up from: usually a holder of the shard at the
/// previous role version, reached over the internal API. Tests stub it.
#[async_trait]
pub trait DiffSource: Send + Sync {
    async fn list_repo(&self) -> Result<Vec<RepoInfo>>;

    /// The commit sequence as recorded by one shard's diffs, oldest first.
    async fn list_commit_for_shard(&self, repo: &Repo, shard: u64) -> Result<Vec<CommitInfo>>;

    /// Raw diff record bytes for byte-exact application.
    async fn pull_diff(&self, diff: &Diff) -> Result<Vec<u8>>;
}

#[async_trait]
impl DiffSource for ClusterClient {
    async fn list_repo(&self) -> Result<Vec<RepoInfo>> {
        ClusterClient::list_repo(self).await
    }

    async fn list_commit_for_shard(&self, repo: &Repo, shard: u64) -> Result<Vec<CommitInfo>> {
        ClusterClient::list_commit_for_shard(self, repo, shard).await
    }

    async fn pull_diff(&self, diff: &Diff) -> Result<Vec<u8>> {
        ClusterClient::pull_diff(self, diff).await
    }
}

#[derive(Clone)]
pub struct ReconcileShardRequest {
    pub shard: u64,
    pub sources: Vec<Arc<dyn DiffSource>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileShardResult {
    pub repos_checked: usize,
    pub diffs_pulled: usize,
}

/// Catch a shard up against its current holders when this node enters the
/// master role.
///
/// The prefix of commits already held locally must match the holder's
/// sequence field by field; any mismatch is divergent data, which aborts
/// the operation before anything newer is applied. This assumes no
/// split-brain writes, so divergence is an operator problem, not
/// something to repair silently.
pub struct ReconcileShardOperation {
    driver: Arc<Driver>,
}

impl ReconcileShardOperation {
    pub fn new(driver: Arc<Driver>) -> Self {
        Self { driver }
    }

    pub async fn run(&self, request: ReconcileShardRequest) -> Result<ReconcileShardResult> {
        let mut result = ReconcileShardResult::default();
        for source in &request.sources {
            for repo_info in source.list_repo().await? {
                result.repos_checked += 1;
                self.driver.ensure_repo(&repo_info).await?;
                let remote: Vec<CommitInfo> = source
                    .list_commit_for_shard(&repo_info.repo, request.shard)
                    .await?
                    .into_iter()
                    .filter(|info| info.commit_type == CommitType::Read)
                    .collect();
                let local = self
                    .driver
                    .list_commit(&repo_info.repo, Some(request.shard))
                    .await?;
                for (index, commit_info) in remote.iter().enumerate() {
                    if index < local.len() {
                        if local[index] != *commit_info {
                            return Err(StrataError::Divergent(format!(
                                "repo {} shard {}: local commit {} does not match holder commit {}",
                                repo_info.repo.name,
                                request.shard,
                                local[index].commit.id,
                                commit_info.commit.id
                            )));
                        }
                        continue;
                    }
                    let diff = Diff {
                        commit: commit_info.commit.clone(),
                        shard: request.shard,
                    };
                    let data = source.pull_diff(&diff).await?;
                    self.driver.push_diff(&diff, &data).await?;
                    result.diffs_pulled += 1;
                    tracing::info!(
                        "pulled diff {}/{}/{}",
                        diff.commit.repo.name,
                        diff.commit.id,
                        diff.shard
                    );
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LocalBlockPeers;
    use crate::sharding::Sharder;
    use crate::storage::{BlockStore, DiffStore};
    use crate::types::DiffInfo;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    struct StubSource {
        repos: Vec<RepoInfo>,
        commits: Vec<CommitInfo>,
        diffs: BTreeMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl DiffSource for StubSource {
        async fn list_repo(&self) -> Result<Vec<RepoInfo>> {
            Ok(self.repos.clone())
        }

        async fn list_commit_for_shard(
            &self,
            _repo: &Repo,
            _shard: u64,
        ) -> Result<Vec<CommitInfo>> {
            Ok(self.commits.clone())
        }

        async fn pull_diff(&self, diff: &Diff) -> Result<Vec<u8>> {
            self.diffs
                .get(&diff.commit.id)
                .cloned()
                .ok_or_else(|| StrataError::NotFound(format!("diff for {}", diff.commit.id)))
        }
    }

    fn driver(dir: &std::path::Path) -> Arc<Driver> {
        let blocks = Arc::new(BlockStore::new(dir, 8 * 1024 * 1024).unwrap());
        let diffs = Arc::new(DiffStore::new(dir).unwrap());
        let peers = Arc::new(LocalBlockPeers::new(blocks.clone()));
        Arc::new(Driver::new(Sharder::new(32, 32), blocks, diffs, peers).unwrap())
    }

    fn finished_diff(repo: &str, commit: &str, shard: u64, size_bytes: u64, at: i64) -> DiffInfo {
        let started = Utc.timestamp_opt(at, 0).unwrap();
        DiffInfo {
            diff: Diff {
                commit: crate::types::Commit::new(repo, commit),
                shard,
            },
            parent: None,
            appends: BTreeMap::new(),
            size_bytes,
            started,
            finished: Some(started),
        }
    }

    fn stub_with_commits(diffs: Vec<DiffInfo>) -> Arc<StubSource> {
        let commits = diffs.iter().map(DiffInfo::commit_info).collect();
        let encoded = diffs
            .iter()
            .map(|diff| (diff.diff.commit.id.clone(), bincode::serialize(diff).unwrap()))
            .collect();
        Arc::new(StubSource {
            repos: vec![RepoInfo {
                repo: Repo::new("r"),
                created: Utc.timestamp_opt(1, 0).unwrap(),
            }],
            commits,
            diffs: encoded,
        })
    }

    #[tokio::test]
    async fn pulls_missing_diffs_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let source = stub_with_commits(vec![
            finished_diff("r", "c1", 5, 12, 100),
            finished_diff("r", "c2", 5, 7, 200),
        ]);

        let operation = ReconcileShardOperation::new(driver.clone());
        let result = operation
            .run(ReconcileShardRequest {
                shard: 5,
                sources: vec![source.clone()],
            })
            .await
            .unwrap();
        assert_eq!(result.diffs_pulled, 2);

        let local = driver.list_commit(&Repo::new("r"), Some(5)).await.unwrap();
        assert_eq!(local, source.commits);

        // a second run finds the prefix intact and pulls nothing
        let again = operation
            .run(ReconcileShardRequest {
                shard: 5,
                sources: vec![source],
            })
            .await
            .unwrap();
        assert_eq!(again.diffs_pulled, 0);
    }

    #[tokio::test]
    async fn divergent_prefix_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());

        // local copy of c1 differs from the holder's by one byte of size
        let mut tampered = finished_diff("r", "c1", 5, 12, 100);
        tampered.size_bytes = 13;
        driver
            .ensure_repo(&RepoInfo {
                repo: Repo::new("r"),
                created: Utc.timestamp_opt(1, 0).unwrap(),
            })
            .await
            .unwrap();
        driver
            .push_diff(&tampered.diff.clone(), &bincode::serialize(&tampered).unwrap())
            .await
            .unwrap();

        let source = stub_with_commits(vec![
            finished_diff("r", "c1", 5, 12, 100),
            finished_diff("r", "c2", 5, 7, 200),
        ]);

        let operation = ReconcileShardOperation::new(driver.clone());
        let err = operation
            .run(ReconcileShardRequest {
                shard: 5,
                sources: vec![source],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Divergent(_)));

        // nothing past the divergence point was applied
        let local = driver.list_commit(&Repo::new("r"), Some(5)).await.unwrap();
        assert_eq!(local.len(), 1);
    }
}
