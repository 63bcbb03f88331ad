use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};
use crate::types::{
    Block, BlockInfo, BlockRef, Commit, CommitInfo, Diff, DiffInfo, File, FileInfo, FileType, Repo,
    RepoInfo,
};

/// Timestamps ride in the request so every node records the same instant
/// and commit records stay byte-comparable across the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRepoRequest {
    pub repo_info: RepoInfo,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCommitRequest {
    pub parent: Option<Commit>,
    pub commit: Commit,
    pub started: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishCommitRequest {
    pub commit: Commit,
    pub finished: DateTime<Utc>,
    pub version: i64,
}

/// HTTP client for one node's internal API. Cached per address by the
/// router; cloning shares the underlying connection pool.
#[derive(Debug, Clone)]
pub struct ClusterClient {
    base_url: String,
    http: reqwest::Client,
}

impl ClusterClient {
    pub fn new(address: &str) -> Self {
        Self {
            base_url: format!("http://{}", address),
            http: reqwest::Client::new(),
        }
    }

    pub fn address(&self) -> &str {
        self.base_url.trim_start_matches("http://")
    }

    pub async fn create_repo(&self, repo_info: &RepoInfo, version: i64) -> Result<()> {
        let request = CreateRepoRequest {
            repo_info: repo_info.clone(),
            version,
        };
        let response = self
            .http
            .post(format!("{}/internal/repos", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?;
        Ok(())
    }

    pub async fn inspect_repo(&self, repo: &Repo) -> Result<RepoInfo> {
        let response = self
            .http
            .get(format!("{}/internal/repos/{}", self.base_url, repo.name))
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?.json().await.map_err(http_err)
    }

    pub async fn list_repo(&self) -> Result<Vec<RepoInfo>> {
        let response = self
            .http
            .get(format!("{}/internal/repos", self.base_url))
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?.json().await.map_err(http_err)
    }

    pub async fn delete_repo(&self, repo: &Repo, version: i64) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/internal/repos/{}", self.base_url, repo.name))
            .query(&[("version", version)])
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?;
        Ok(())
    }

    pub async fn start_commit(&self, request: &StartCommitRequest) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/internal/commits", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?;
        Ok(())
    }

    pub async fn finish_commit(&self, request: &FinishCommitRequest) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/internal/commits/finish", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?;
        Ok(())
    }

    pub async fn inspect_commit(&self, commit: &Commit) -> Result<CommitInfo> {
        let response = self
            .http
            .get(format!(
                "{}/internal/repos/{}/commits/{}",
                self.base_url, commit.repo.name, commit.id
            ))
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?.json().await.map_err(http_err)
    }

    pub async fn list_commit(&self, repo: &Repo) -> Result<Vec<CommitInfo>> {
        let response = self
            .http
            .get(format!(
                "{}/internal/repos/{}/commits",
                self.base_url, repo.name
            ))
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?.json().await.map_err(http_err)
    }

    /// Commit sequence as recorded by one shard's diffs on this node.
    pub async fn list_commit_for_shard(&self, repo: &Repo, shard: u64) -> Result<Vec<CommitInfo>> {
        let response = self
            .http
            .get(format!(
                "{}/internal/repos/{}/commits",
                self.base_url, repo.name
            ))
            .query(&[("shard", shard)])
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?.json().await.map_err(http_err)
    }

    pub async fn delete_commit(&self, commit: &Commit, version: i64) -> Result<()> {
        let response = self
            .http
            .delete(format!(
                "{}/internal/repos/{}/commits/{}",
                self.base_url, commit.repo.name, commit.id
            ))
            .query(&[("version", version)])
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?;
        Ok(())
    }

    pub async fn put_file(
        &self,
        file: &File,
        file_type: FileType,
        offset: u64,
        version: i64,
        data: Bytes,
    ) -> Result<()> {
        let file_type = match file_type {
            FileType::Regular => "regular",
            FileType::Dir => "dir",
        };
        let response = self
            .http
            .put(self.file_url(file))
            .query(&[("version", version.to_string())])
            .query(&[("offset", offset.to_string())])
            .query(&[("file_type", file_type.to_string())])
            .body(data)
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?;
        Ok(())
    }

    pub async fn get_file(
        &self,
        file: &File,
        offset: u64,
        size: u64,
        shard: Option<u64>,
        version: i64,
    ) -> Result<Bytes> {
        let mut request = self
            .http
            .get(self.file_url(file))
            .query(&[("offset", offset.to_string())])
            .query(&[("size", size.to_string())])
            .query(&[("version", version.to_string())]);
        if let Some(shard) = shard {
            request = request.query(&[("shard", shard)]);
        }
        let response = request.send().await.map_err(http_err)?;
        check(response).await?.bytes().await.map_err(http_err)
    }

    pub async fn inspect_file(
        &self,
        file: &File,
        shard: Option<u64>,
        version: i64,
    ) -> Result<FileInfo> {
        let mut request = self
            .http
            .get(format!(
                "{}/internal/repos/{}/commits/{}/file-info/{}",
                self.base_url, file.commit.repo.name, file.commit.id, file.path
            ))
            .query(&[("version", version)]);
        if let Some(shard) = shard {
            request = request.query(&[("shard", shard)]);
        }
        let response = request.send().await.map_err(http_err)?;
        check(response).await?.json().await.map_err(http_err)
    }

    pub async fn list_file(&self, file: &File, version: i64) -> Result<Vec<FileInfo>> {
        let url = if file.path.is_empty() {
            format!(
                "{}/internal/repos/{}/commits/{}/file-list",
                self.base_url, file.commit.repo.name, file.commit.id
            )
        } else {
            format!(
                "{}/internal/repos/{}/commits/{}/file-list/{}",
                self.base_url, file.commit.repo.name, file.commit.id, file.path
            )
        };
        let response = self
            .http
            .get(url)
            .query(&[("version", version)])
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?.json().await.map_err(http_err)
    }

    pub async fn delete_file(&self, file: &File, version: i64) -> Result<()> {
        let response = self
            .http
            .delete(self.file_url(file))
            .query(&[("version", version)])
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?;
        Ok(())
    }

    pub async fn put_block(&self, data: Bytes) -> Result<Vec<BlockRef>> {
        let response = self
            .http
            .post(format!("{}/internal/blocks", self.base_url))
            .body(data)
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?.json().await.map_err(http_err)
    }

    /// Place one already-chunked block verbatim on this node.
    pub async fn put_block_exact(&self, block: &Block, data: Bytes) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/internal/blocks/{}", self.base_url, block.hash))
            .body(data)
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?;
        Ok(())
    }

    pub async fn get_block(&self, block: &Block, offset: u64, size: u64) -> Result<Bytes> {
        let response = self
            .http
            .get(format!("{}/internal/blocks/{}", self.base_url, block.hash))
            .query(&[("offset", offset.to_string()), ("size", size.to_string())])
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?.bytes().await.map_err(http_err)
    }

    pub async fn inspect_block(&self, block: &Block) -> Result<BlockInfo> {
        let response = self
            .http
            .get(format!(
                "{}/internal/blocks/{}/info",
                self.base_url, block.hash
            ))
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?.json().await.map_err(http_err)
    }

    pub async fn list_block(&self) -> Result<Vec<BlockInfo>> {
        let response = self
            .http
            .get(format!("{}/internal/blocks", self.base_url))
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?.json().await.map_err(http_err)
    }

    pub async fn inspect_diff(&self, diff: &Diff) -> Result<DiffInfo> {
        let response = self
            .http
            .get(format!("{}/info", self.diff_url(diff)))
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?.json().await.map_err(http_err)
    }

    pub async fn list_diff(&self, shard: u64) -> Result<Vec<DiffInfo>> {
        let response = self
            .http
            .get(format!("{}/internal/diffs", self.base_url))
            .query(&[("shard", shard)])
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?.json().await.map_err(http_err)
    }

    /// Raw diff record bytes, for byte-exact replication.
    pub async fn pull_diff(&self, diff: &Diff) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(self.diff_url(diff))
            .send()
            .await
            .map_err(http_err)?;
        let bytes = check(response).await?.bytes().await.map_err(http_err)?;
        Ok(bytes.to_vec())
    }

    pub async fn push_diff(&self, diff: &Diff, data: Vec<u8>) -> Result<()> {
        let response = self
            .http
            .put(self.diff_url(diff))
            .body(data)
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?;
        Ok(())
    }

    pub async fn delete_diff(&self, diff: &Diff) -> Result<()> {
        let response = self
            .http
            .delete(self.diff_url(diff))
            .send()
            .await
            .map_err(http_err)?;
        check(response).await?;
        Ok(())
    }

    fn file_url(&self, file: &File) -> String {
        format!(
            "{}/internal/repos/{}/commits/{}/files/{}",
            self.base_url, file.commit.repo.name, file.commit.id, file.path
        )
    }

    fn diff_url(&self, diff: &Diff) -> String {
        format!(
            "{}/internal/diffs/{}/{}/{}",
            self.base_url, diff.commit.repo.name, diff.commit.id, diff.shard
        )
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(StrataError::from_status(status.as_u16(), message))
}

fn http_err(err: reqwest::Error) -> StrataError {
    StrataError::Http(err.to_string())
}
