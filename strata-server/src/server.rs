use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use strata_core::{
    Block, ClusterController, Commit, ControllerOptions, CreateRepoRequest, Driver, File, FileInfo,
    FileType, FinishCommitRequest, Frontend, NodeConn, Registry, RegistryBackend, RegistryBuilder,
    Repo, RepoInfo, Result, Router as ShardRouter, Sharder, ShardServer, StartCommitRequest,
    StrataConfig, StrataError, BlockStore, Diff, DiffStore, INITIAL_COMMIT_ID, INVALID_VERSION,
};

use crate::node::{GatewayFrontend, NodeShardServer, RoutedBlockPeers};

pub struct AppState {
    pub driver: Arc<Driver>,
    pub router: Arc<ShardRouter>,
    pub current_version: Arc<AtomicI64>,
}

impl AppState {
    fn route_version(&self) -> std::result::Result<i64, ApiError> {
        let version = self.current_version.load(Ordering::SeqCst);
        if version == INVALID_VERSION {
            return Err(StrataError::Transient(
                "no role assignment published yet".to_string(),
            )
            .into());
        }
        Ok(version)
    }
}

pub async fn build_registry(config: &StrataConfig) -> Result<Arc<dyn Registry>> {
    let mut builder = RegistryBuilder::new();
    builder = match config.registry.backend {
        RegistryBackend::Etcd => {
            let etcd = config.registry.etcd.as_ref().ok_or_else(|| {
                StrataError::Config("etcd configuration is required for etcd backend".to_string())
            })?;
            builder
                .backend("etcd")
                .etcd_endpoints(etcd.endpoints.clone())
        }
        RegistryBackend::Memory => builder.backend("memory"),
    };
    builder.build().await
}

pub fn build_controller(
    config: &StrataConfig,
    registry: Arc<dyn Registry>,
) -> Arc<ClusterController> {
    Arc::new(ClusterController::new(
        registry,
        config.cluster.namespace.clone(),
        config.cluster.num_shards,
        config.cluster.num_replicas,
        ControllerOptions {
            hold_ttl_seconds: config.cluster.hold_ttl_seconds,
        },
    ))
}

pub async fn run_server(config: StrataConfig) -> Result<()> {
    let local_address = config.node.effective_address();
    let registry = build_registry(&config).await?;
    let controller = build_controller(&config, registry);

    let blocks = Arc::new(BlockStore::new(
        &config.node.data_dir,
        config.cluster.block_size_bytes,
    )?);
    let diffs = Arc::new(DiffStore::new(&config.node.data_dir)?);
    let sharder = Sharder::new(config.cluster.num_shards, config.cluster.num_shards);
    let router = Arc::new(ShardRouter::new(
        sharder,
        controller.clone(),
        local_address.clone(),
    ));
    let peers = Arc::new(RoutedBlockPeers::new(router.clone()));
    let driver = Arc::new(Driver::new(sharder, blocks, diffs, peers)?);
    let current_version = Arc::new(AtomicI64::new(INVALID_VERSION));

    let cancel = CancellationToken::new();
    spawn_registration(
        controller.clone(),
        local_address.clone(),
        Arc::new(NodeShardServer::new(driver.clone(), router.clone())),
        Arc::new(GatewayFrontend::new(current_version.clone())),
        cancel.clone(),
    );

    let state = Arc::new(AppState {
        driver,
        router,
        current_version,
    });
    let app = app(state);

    let listener = tokio::net::TcpListener::bind(&config.node.bind_addr).await?;
    tracing::info!("server {} listening on {}", local_address, config.node.bind_addr);
    axum::serve(listener, app).await?;
    cancel.cancel();
    Ok(())
}

/// Membership loops survive transient registration failures by backing
/// off and re-registering; only cancellation ends them.
fn spawn_registration(
    controller: Arc<ClusterController>,
    address: String,
    server: Arc<dyn ShardServer>,
    frontend: Arc<dyn Frontend>,
    cancel: CancellationToken,
) {
    {
        let controller = controller.clone();
        let address = address.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                match controller.register(&address, server.clone(), cancel.clone()).await {
                    Err(StrataError::Cancelled) | Ok(()) => break,
                    Err(err) => {
                        tracing::error!("server registration failed: {}; retrying", err);
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                }
            }
        });
    }
    tokio::spawn(async move {
        loop {
            match controller
                .register_frontend(&address, frontend.clone(), cancel.clone())
                .await
            {
                Err(StrataError::Cancelled) | Ok(()) => break,
                Err(err) => {
                    tracing::error!("frontend registration failed: {}; retrying", err);
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            }
        }
    });
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        // public API
        .route("/repos", post(create_repo).get(list_repos))
        .route("/repos/{repo}", get(inspect_repo).delete(delete_repo))
        .route("/repos/{repo}/commits", post(start_commit).get(list_commits))
        .route(
            "/repos/{repo}/commits/{commit}",
            get(inspect_commit).delete(delete_commit),
        )
        .route("/repos/{repo}/commits/{commit}/finish", post(finish_commit))
        .route(
            "/repos/{repo}/commits/{commit}/files/{*path}",
            put(put_file).get(get_file).delete(delete_file),
        )
        .route(
            "/repos/{repo}/commits/{commit}/file-info/{*path}",
            get(inspect_file),
        )
        .route("/repos/{repo}/commits/{commit}/file-list", get(list_root))
        .route(
            "/repos/{repo}/commits/{commit}/file-list/{*path}",
            get(list_file),
        )
        // internal API: operations scoped to the shards this node owns;
        // routing already happened on the caller's side
        .route(
            "/internal/repos",
            post(internal_create_repo).get(internal_list_repos),
        )
        .route(
            "/internal/repos/{repo}",
            get(internal_inspect_repo).delete(internal_delete_repo),
        )
        .route("/internal/commits", post(internal_start_commit))
        .route("/internal/commits/finish", post(internal_finish_commit))
        .route("/internal/repos/{repo}/commits", get(internal_list_commits))
        .route(
            "/internal/repos/{repo}/commits/{commit}",
            get(internal_inspect_commit).delete(internal_delete_commit),
        )
        .route(
            "/internal/repos/{repo}/commits/{commit}/files/{*path}",
            put(internal_put_file)
                .get(internal_get_file)
                .delete(internal_delete_file),
        )
        .route(
            "/internal/repos/{repo}/commits/{commit}/file-info/{*path}",
            get(internal_inspect_file),
        )
        .route(
            "/internal/repos/{repo}/commits/{commit}/file-list",
            get(internal_list_root),
        )
        .route(
            "/internal/repos/{repo}/commits/{commit}/file-list/{*path}",
            get(internal_list_file),
        )
        .route(
            "/internal/blocks",
            post(internal_put_block).get(internal_list_block),
        )
        .route(
            "/internal/blocks/{hash}",
            put(internal_put_block_exact).get(internal_get_block),
        )
        .route("/internal/blocks/{hash}/info", get(internal_inspect_block))
        .route("/internal/diffs", get(internal_list_diff))
        .route(
            "/internal/diffs/{repo}/{commit}/{shard}",
            get(internal_pull_diff)
                .put(internal_push_diff)
                .delete(internal_delete_diff),
        )
        .route(
            "/internal/diffs/{repo}/{commit}/{shard}/info",
            get(internal_inspect_diff),
        )
        .with_state(state)
}

struct ApiError(StrataError);

impl From<StrataError> for ApiError {
    fn from(err: StrataError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, self.0.to_string()).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn invalid_version() -> i64 {
    INVALID_VERSION
}

#[derive(Deserialize)]
struct VersionQuery {
    #[serde(default = "invalid_version")]
    version: i64,
}

#[derive(Deserialize)]
struct FileWriteQuery {
    #[serde(default = "invalid_version")]
    version: i64,
    #[serde(default)]
    file_type: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    offset: u64,
}

#[derive(Deserialize)]
struct FileReadQuery {
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    shard: Option<u64>,
    #[serde(default = "invalid_version")]
    version: i64,
}

#[derive(Deserialize)]
struct ShardQuery {
    #[serde(default)]
    shard: Option<u64>,
}

#[derive(Deserialize)]
struct DiffListQuery {
    shard: u64,
}

#[derive(Deserialize)]
struct BlockReadQuery {
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    size: u64,
}

#[derive(Deserialize)]
struct CreateRepoBody {
    name: String,
}

#[derive(Deserialize)]
struct StartCommitBody {
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

fn read_size(size: u64) -> u64 {
    if size == 0 {
        u64::MAX
    } else {
        size
    }
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let shards = state.driver.local_shards().await;
    Json(serde_json::json!({
        "address": state.router.local_address(),
        "version": state.current_version.load(Ordering::SeqCst),
        "shards": shards.len(),
    }))
}

// ---- public: repos -------------------------------------------------------

async fn create_repo(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRepoBody>,
) -> ApiResult<Json<RepoInfo>> {
    let version = state.route_version()?;
    let repo_info = RepoInfo {
        repo: Repo::new(&body.name),
        created: Utc::now(),
    };
    for conn in state.router.all_conns(version).await? {
        match conn {
            NodeConn::Local => state.driver.create_repo(&repo_info, version).await?,
            NodeConn::Remote(client) => client.create_repo(&repo_info, version).await?,
        }
    }
    // the empty initial commit exists from the moment the repo does
    let initial = Commit::new(&body.name, INITIAL_COMMIT_ID);
    let started = Utc::now();
    start_commit_everywhere(&state, None, initial.clone(), started, version).await?;
    finish_commit_everywhere(&state, initial, Utc::now(), version).await?;
    Ok(Json(repo_info))
}

async fn list_repos(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<RepoInfo>>> {
    Ok(Json(state.driver.list_repo().await?))
}

async fn inspect_repo(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
) -> ApiResult<Json<RepoInfo>> {
    Ok(Json(state.driver.inspect_repo(&Repo::new(repo)).await?))
}

async fn delete_repo(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
) -> ApiResult<StatusCode> {
    let version = state.route_version()?;
    let repo = Repo::new(repo);
    for conn in state.router.all_conns(version).await? {
        match conn {
            NodeConn::Local => state.driver.delete_repo(&repo, version).await?,
            NodeConn::Remote(client) => client.delete_repo(&repo, version).await?,
        }
    }
    Ok(StatusCode::OK)
}

// ---- public: commits -----------------------------------------------------

async fn start_commit(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    Json(body): Json<StartCommitBody>,
) -> ApiResult<Json<Commit>> {
    let version = state.route_version()?;
    let id = body.id.unwrap_or_else(|| Ulid::new().to_string());
    let commit = Commit::new(&repo, id);
    let parent = body.parent_id.map(|parent| Commit::new(&repo, parent));
    start_commit_everywhere(&state, parent, commit.clone(), Utc::now(), version).await?;
    Ok(Json(commit))
}

async fn finish_commit(
    State(state): State<Arc<AppState>>,
    Path((repo, commit)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let version = state.route_version()?;
    finish_commit_everywhere(&state, Commit::new(repo, commit), Utc::now(), version).await?;
    Ok(StatusCode::OK)
}

async fn start_commit_everywhere(
    state: &AppState,
    parent: Option<Commit>,
    commit: Commit,
    started: chrono::DateTime<Utc>,
    version: i64,
) -> ApiResult<()> {
    let request = StartCommitRequest {
        parent: parent.clone(),
        commit: commit.clone(),
        started,
        version,
    };
    for conn in state.router.all_conns(version).await? {
        match conn {
            NodeConn::Local => {
                state
                    .driver
                    .start_commit(parent.clone(), commit.clone(), started, version)
                    .await?
            }
            NodeConn::Remote(client) => client.start_commit(&request).await?,
        }
    }
    Ok(())
}

async fn finish_commit_everywhere(
    state: &AppState,
    commit: Commit,
    finished: chrono::DateTime<Utc>,
    version: i64,
) -> ApiResult<()> {
    let request = FinishCommitRequest {
        commit: commit.clone(),
        finished,
        version,
    };
    for conn in state.router.all_conns(version).await? {
        match conn {
            NodeConn::Local => state.driver.finish_commit(&commit, finished, version).await?,
            NodeConn::Remote(client) => client.finish_commit(&request).await?,
        }
    }
    Ok(())
}

async fn list_commits(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
) -> ApiResult<Json<Vec<strata_core::CommitInfo>>> {
    Ok(Json(state.driver.list_commit(&Repo::new(repo), None).await?))
}

async fn inspect_commit(
    State(state): State<Arc<AppState>>,
    Path((repo, commit)): Path<(String, String)>,
) -> ApiResult<Json<strata_core::CommitInfo>> {
    Ok(Json(
        state.driver.inspect_commit(&Commit::new(repo, commit)).await?,
    ))
}

async fn delete_commit(
    State(state): State<Arc<AppState>>,
    Path((repo, commit)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let version = state.route_version()?;
    let commit = Commit::new(repo, commit);
    for conn in state.router.all_conns(version).await? {
        match conn {
            NodeConn::Local => state.driver.delete_commit(&commit, version).await?,
            NodeConn::Remote(client) => client.delete_commit(&commit, version).await?,
        }
    }
    Ok(StatusCode::OK)
}

// ---- public: files -------------------------------------------------------

async fn put_file(
    State(state): State<Arc<AppState>>,
    Path((repo, commit, path)): Path<(String, String, String)>,
    Query(query): Query<FileWriteQuery>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let version = state.route_version()?;
    let file = File::new(repo, commit, path);
    if file.path.starts_with('/') {
        return Err(StrataError::InvalidArgument(format!(
            "leading slash in path: {}",
            file.path
        ))
        .into());
    }
    if query.file_type.as_deref() == Some("dir") {
        if !body.is_empty() {
            return Err(StrataError::InvalidArgument(
                "directory writes cannot carry data".to_string(),
            )
            .into());
        }
        // directories fan out: the master of the directory's shard records it
        for conn in state.router.all_conns(version).await? {
            match conn {
                NodeConn::Local => state.driver.make_directory(&file, version).await?,
                NodeConn::Remote(client) => {
                    client
                        .put_file(&file, FileType::Dir, 0, version, Bytes::new())
                        .await?
                }
            }
        }
        return Ok(StatusCode::CREATED);
    }
    let shard = state.router.sharder().shard_for_file(&file);
    match state.router.master_conn(shard, version).await? {
        NodeConn::Local => state.driver.put_file_bytes(&file, version, body).await?,
        NodeConn::Remote(client) => {
            client
                .put_file(&file, FileType::Regular, 0, version, body)
                .await?
        }
    }
    Ok(StatusCode::CREATED)
}

async fn get_file(
    State(state): State<Arc<AppState>>,
    Path((repo, commit, path)): Path<(String, String, String)>,
    Query(query): Query<FileReadQuery>,
) -> ApiResult<Bytes> {
    let version = state.route_version()?;
    let file = File::new(repo, commit, path);
    let size = read_size(query.size);
    let shard = state.router.sharder().shard_for_file(&file);
    let data = match state.router.master_or_replica_conn(shard, version).await? {
        NodeConn::Local => {
            state
                .driver
                .get_file(&file, query.offset, size, None, version)
                .await?
        }
        NodeConn::Remote(client) => {
            client
                .get_file(&file, query.offset, size, None, version)
                .await?
        }
    };
    Ok(data)
}

async fn inspect_file(
    State(state): State<Arc<AppState>>,
    Path((repo, commit, path)): Path<(String, String, String)>,
) -> ApiResult<Json<FileInfo>> {
    let version = state.route_version()?;
    let file = File::new(repo, commit, path);
    let shard = state.router.sharder().shard_for_file(&file);
    let info = match state.router.master_or_replica_conn(shard, version).await? {
        NodeConn::Local => state.driver.inspect_file(&file, None).await?,
        NodeConn::Remote(client) => client.inspect_file(&file, None, version).await?,
    };
    Ok(Json(info))
}

async fn list_root(
    state: State<Arc<AppState>>,
    Path((repo, commit)): Path<(String, String)>,
) -> ApiResult<Json<Vec<FileInfo>>> {
    list_file(state, Path((repo, commit, String::new()))).await
}

/// ListFile fans out to every node and merges; directories appear on every
/// shard that holds one of their children, so they dedup by path with
/// their child sets unioned.
async fn list_file(
    State(state): State<Arc<AppState>>,
    Path((repo, commit, path)): Path<(String, String, String)>,
) -> ApiResult<Json<Vec<FileInfo>>> {
    let version = state.route_version()?;
    let file = File::new(repo, commit, path);
    let mut merged: BTreeMap<String, FileInfo> = BTreeMap::new();
    let mut found = false;
    for conn in state.router.all_conns(version).await? {
        let infos = match conn {
            NodeConn::Local => state.driver.list_file(&file, None).await,
            NodeConn::Remote(client) => client.list_file(&file, version).await,
        };
        let infos = match infos {
            Ok(infos) => infos,
            Err(StrataError::NotFound(_)) => continue,
            Err(err) => return Err(err.into()),
        };
        found = true;
        for info in infos {
            match merged.get_mut(&info.file.path) {
                Some(existing)
                    if existing.file_type == FileType::Dir
                        && info.file_type == FileType::Dir =>
                {
                    existing.children.extend(info.children);
                }
                Some(_) => {}
                None => {
                    merged.insert(info.file.path.clone(), info);
                }
            }
        }
    }
    if !found {
        return Err(StrataError::NotFound(format!("file {}", file.path)).into());
    }
    Ok(Json(merged.into_values().collect()))
}

async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path((repo, commit, path)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    let version = state.route_version()?;
    let file = File::new(repo, commit, path);
    let shard = state.router.sharder().shard_for_file(&file);
    match state.router.master_conn(shard, version).await? {
        NodeConn::Local => state.driver.delete_file(&file, version).await?,
        NodeConn::Remote(client) => client.delete_file(&file, version).await?,
    }
    Ok(StatusCode::OK)
}

// ---- internal: repos and commits ----------------------------------------

async fn internal_create_repo(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRepoRequest>,
) -> ApiResult<StatusCode> {
    state
        .driver
        .create_repo(&request.repo_info, request.version)
        .await?;
    Ok(StatusCode::CREATED)
}

async fn internal_list_repos(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<RepoInfo>>> {
    Ok(Json(state.driver.list_repo().await?))
}

async fn internal_inspect_repo(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
) -> ApiResult<Json<RepoInfo>> {
    Ok(Json(state.driver.inspect_repo(&Repo::new(repo)).await?))
}

async fn internal_delete_repo(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    Query(query): Query<VersionQuery>,
) -> ApiResult<StatusCode> {
    state
        .driver
        .delete_repo(&Repo::new(repo), query.version)
        .await?;
    Ok(StatusCode::OK)
}

async fn internal_start_commit(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartCommitRequest>,
) -> ApiResult<StatusCode> {
    state
        .driver
        .start_commit(request.parent, request.commit, request.started, request.version)
        .await?;
    Ok(StatusCode::CREATED)
}

async fn internal_finish_commit(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FinishCommitRequest>,
) -> ApiResult<StatusCode> {
    state
        .driver
        .finish_commit(&request.commit, request.finished, request.version)
        .await?;
    Ok(StatusCode::OK)
}

async fn internal_list_commits(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    Query(query): Query<ShardQuery>,
) -> ApiResult<Json<Vec<strata_core::CommitInfo>>> {
    Ok(Json(
        state
            .driver
            .list_commit(&Repo::new(repo), query.shard)
            .await?,
    ))
}

async fn internal_inspect_commit(
    State(state): State<Arc<AppState>>,
    Path((repo, commit)): Path<(String, String)>,
) -> ApiResult<Json<strata_core::CommitInfo>> {
    Ok(Json(
        state.driver.inspect_commit(&Commit::new(repo, commit)).await?,
    ))
}

async fn internal_delete_commit(
    State(state): State<Arc<AppState>>,
    Path((repo, commit)): Path<(String, String)>,
    Query(query): Query<VersionQuery>,
) -> ApiResult<StatusCode> {
    state
        .driver
        .delete_commit(&Commit::new(repo, commit), query.version)
        .await?;
    Ok(StatusCode::OK)
}

// ---- internal: files -----------------------------------------------------

async fn internal_put_file(
    State(state): State<Arc<AppState>>,
    Path((repo, commit, path)): Path<(String, String, String)>,
    Query(query): Query<FileWriteQuery>,
    body: Body,
) -> ApiResult<StatusCode> {
    let file = File::new(repo, commit, path);
    if query.file_type.as_deref() == Some("dir") {
        state.driver.make_directory(&file, query.version).await?;
        return Ok(StatusCode::CREATED);
    }
    let stream = Box::pin(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(|err| StrataError::Http(err.to_string()))),
    );
    state.driver.put_file(&file, query.version, stream).await?;
    Ok(StatusCode::CREATED)
}

async fn internal_get_file(
    State(state): State<Arc<AppState>>,
    Path((repo, commit, path)): Path<(String, String, String)>,
    Query(query): Query<FileReadQuery>,
) -> ApiResult<Bytes> {
    let file = File::new(repo, commit, path);
    Ok(state
        .driver
        .get_file(
            &file,
            query.offset,
            read_size(query.size),
            query.shard,
            query.version,
        )
        .await?)
}

async fn internal_inspect_file(
    State(state): State<Arc<AppState>>,
    Path((repo, commit, path)): Path<(String, String, String)>,
    Query(query): Query<ShardQuery>,
) -> ApiResult<Json<FileInfo>> {
    let file = File::new(repo, commit, path);
    Ok(Json(state.driver.inspect_file(&file, query.shard).await?))
}

async fn internal_list_root(
    state: State<Arc<AppState>>,
    Path((repo, commit)): Path<(String, String)>,
    query: Query<ShardQuery>,
) -> ApiResult<Json<Vec<FileInfo>>> {
    internal_list_file(state, Path((repo, commit, String::new())), query).await
}

async fn internal_list_file(
    State(state): State<Arc<AppState>>,
    Path((repo, commit, path)): Path<(String, String, String)>,
    Query(query): Query<ShardQuery>,
) -> ApiResult<Json<Vec<FileInfo>>> {
    let file = File::new(repo, commit, path);
    Ok(Json(state.driver.list_file(&file, query.shard).await?))
}

async fn internal_delete_file(
    State(state): State<Arc<AppState>>,
    Path((repo, commit, path)): Path<(String, String, String)>,
    Query(query): Query<VersionQuery>,
) -> ApiResult<StatusCode> {
    let file = File::new(repo, commit, path);
    state.driver.delete_file(&file, query.version).await?;
    Ok(StatusCode::OK)
}

// ---- internal: blocks and diffs -----------------------------------------

async fn internal_put_block(
    State(state): State<Arc<AppState>>,
    body: Body,
) -> ApiResult<Json<Vec<strata_core::BlockRef>>> {
    let stream = Box::pin(
        body.into_data_stream()
            .map(|chunk| chunk.map_err(|err| StrataError::Http(err.to_string()))),
    );
    let refs = state.driver.block_store().put_blocks(stream).await?;
    Ok(Json(refs))
}

async fn internal_put_block_exact(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let written = state.driver.block_store().put_block(&body).await?;
    if written.block.hash != hash {
        return Err(StrataError::InvalidArgument(format!(
            "block content hashes to {}, not {}",
            written.block.hash, hash
        ))
        .into());
    }
    Ok(StatusCode::CREATED)
}

async fn internal_get_block(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    Query(query): Query<BlockReadQuery>,
) -> ApiResult<Bytes> {
    Ok(state
        .driver
        .block_store()
        .get_block(&Block::new(hash), query.offset, read_size(query.size))
        .await?)
}

async fn internal_list_block(
    State(_state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<strata_core::BlockInfo>>> {
    Err(StrataError::Internal("list block is not implemented".to_string()).into())
}

async fn internal_inspect_block(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> ApiResult<Json<strata_core::BlockInfo>> {
    Ok(Json(
        state
            .driver
            .block_store()
            .inspect_block(&Block::new(hash))
            .await?,
    ))
}

async fn internal_list_diff(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DiffListQuery>,
) -> ApiResult<Json<Vec<strata_core::DiffInfo>>> {
    Ok(Json(state.driver.list_diff(query.shard).await?))
}

async fn internal_pull_diff(
    State(state): State<Arc<AppState>>,
    Path((repo, commit, shard)): Path<(String, String, u64)>,
) -> ApiResult<Vec<u8>> {
    let diff = Diff {
        commit: Commit::new(repo, commit),
        shard,
    };
    Ok(state.driver.pull_diff(&diff).await?)
}

async fn internal_push_diff(
    State(state): State<Arc<AppState>>,
    Path((repo, commit, shard)): Path<(String, String, u64)>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let diff = Diff {
        commit: Commit::new(repo, commit),
        shard,
    };
    state.driver.push_diff(&diff, &body).await?;
    Ok(StatusCode::CREATED)
}

async fn internal_inspect_diff(
    State(state): State<Arc<AppState>>,
    Path((repo, commit, shard)): Path<(String, String, u64)>,
) -> ApiResult<Json<strata_core::DiffInfo>> {
    let diff = Diff {
        commit: Commit::new(repo, commit),
        shard,
    };
    Ok(Json(state.driver.inspect_diff(&diff).await?))
}

async fn internal_delete_diff(
    State(state): State<Arc<AppState>>,
    Path((repo, commit, shard)): Path<(String, String, u64)>,
) -> ApiResult<StatusCode> {
    let diff = Diff {
        commit: Commit::new(repo, commit),
        shard,
    };
    state.driver.delete_diff(&diff).await?;
    Ok(StatusCode::OK)
}
