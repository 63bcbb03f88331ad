use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, StrataError};
use crate::types::{Diff, DiffInfo};

/// One binary-encoded `DiffInfo` per `diff/{repo}/{commitID}/{shardID}`
/// file. Records are written whole with a temp-then-rename so replicas can
/// copy them byte for byte.
pub struct DiffStore {
    data_dir: PathBuf,
}

impl DiffStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            data_dir: data_dir.into(),
        };
        std::fs::create_dir_all(store.diff_dir())?;
        Ok(store)
    }

    pub async fn create_diff(&self, info: &DiffInfo) -> Result<()> {
        let data = bincode::serialize(info)?;
        self.put_diff_bytes(&info.diff, &data).await
    }

    /// Write a diff record from raw bytes, preserving them exactly. Used
    /// by replica reconciliation.
    pub async fn put_diff_bytes(&self, diff: &Diff, data: &[u8]) -> Result<()> {
        let path = self.diff_path(diff);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("tmp");
        let result: Result<()> = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    pub async fn inspect_diff(&self, diff: &Diff) -> Result<DiffInfo> {
        let data = self.diff_bytes(diff).await?;
        let info: DiffInfo = bincode::deserialize(&data)?;
        Ok(info)
    }

    /// Raw record bytes, for byte-exact replication.
    pub async fn diff_bytes(&self, diff: &Diff) -> Result<Vec<u8>> {
        match fs::read(self.diff_path(diff)).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StrataError::NotFound(
                format!("diff {}/{}/{}", diff.commit.repo.name, diff.commit.id, diff.shard),
            )),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn has_diff(&self, diff: &Diff) -> Result<bool> {
        Ok(fs::try_exists(self.diff_path(diff)).await?)
    }

    /// Every diff recorded for one shard, across all repos and commits.
    pub async fn list_diff(&self, shard: u64) -> Result<Vec<DiffInfo>> {
        let mut result = Vec::new();
        let shard_name = shard.to_string();
        let mut repos = match fs::read_dir(self.diff_dir()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(result),
            Err(err) => return Err(err.into()),
        };
        while let Some(repo_entry) = repos.next_entry().await? {
            if !repo_entry.file_type().await?.is_dir() {
                continue;
            }
            let mut commits = fs::read_dir(repo_entry.path()).await?;
            while let Some(commit_entry) = commits.next_entry().await? {
                if !commit_entry.file_type().await?.is_dir() {
                    continue;
                }
                let path = commit_entry.path().join(&shard_name);
                if fs::try_exists(&path).await? {
                    let data = fs::read(&path).await?;
                    result.push(bincode::deserialize(&data)?);
                }
            }
        }
        Ok(result)
    }

    pub async fn delete_diff(&self, diff: &Diff) -> Result<()> {
        match fs::remove_file(self.diff_path(diff)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(StrataError::NotFound(
                format!("diff {}/{}/{}", diff.commit.repo.name, diff.commit.id, diff.shard),
            )),
            Err(err) => Err(err.into()),
        }
    }

    pub fn diff_dir(&self) -> PathBuf {
        self.data_dir.join("diff")
    }

    pub fn repo_dir(&self, repo_name: &str) -> PathBuf {
        self.diff_dir().join(repo_name)
    }

    pub fn commit_dir(&self, repo_name: &str, commit_id: &str) -> PathBuf {
        self.repo_dir(repo_name).join(commit_id)
    }

    fn diff_path(&self, diff: &Diff) -> PathBuf {
        self.commit_dir(&diff.commit.repo.name, &diff.commit.id)
            .join(diff.shard.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Append, Commit};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn sample_diff_info(repo: &str, commit: &str, shard: u64) -> DiffInfo {
        let mut appends = BTreeMap::new();
        appends.insert("a.txt".to_string(), Append::regular(None));
        DiffInfo {
            diff: Diff {
                commit: Commit::new(repo, commit),
                shard,
            },
            parent: None,
            appends,
            size_bytes: 12,
            started: Utc::now(),
            finished: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn create_inspect_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiffStore::new(dir.path()).unwrap();

        let info = sample_diff_info("r", "c1", 3);
        store.create_diff(&info).await.unwrap();
        let read = store.inspect_diff(&info.diff).await.unwrap();
        assert_eq!(read, info);
    }

    #[tokio::test]
    async fn bytes_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiffStore::new(dir.path()).unwrap();

        let info = sample_diff_info("r", "c1", 3);
        store.create_diff(&info).await.unwrap();
        let bytes = store.diff_bytes(&info.diff).await.unwrap();

        let other = DiffStore::new(tempfile::tempdir().unwrap().path()).unwrap();
        other.put_diff_bytes(&info.diff, &bytes).await.unwrap();
        assert_eq!(other.diff_bytes(&info.diff).await.unwrap(), bytes);
    }

    #[tokio::test]
    async fn list_filters_by_shard() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiffStore::new(dir.path()).unwrap();

        store.create_diff(&sample_diff_info("r", "c1", 0)).await.unwrap();
        store.create_diff(&sample_diff_info("r", "c2", 0)).await.unwrap();
        store.create_diff(&sample_diff_info("s", "c3", 0)).await.unwrap();
        store.create_diff(&sample_diff_info("r", "c1", 1)).await.unwrap();

        let listed = store.list_diff(0).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|info| info.diff.shard == 0));
    }

    #[tokio::test]
    async fn delete_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiffStore::new(dir.path()).unwrap();

        let info = sample_diff_info("r", "c1", 3);
        store.create_diff(&info).await.unwrap();
        store.delete_diff(&info.diff).await.unwrap();

        let err = store.inspect_diff(&info.diff).await.unwrap_err();
        assert!(matches!(err, StrataError::NotFound(_)));
        let err = store.delete_diff(&info.diff).await.unwrap_err();
        assert!(matches!(err, StrataError::NotFound(_)));
    }
}
