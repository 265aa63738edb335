//! GitHub repository backend.
//!
//! # Responsibility
//! - Store the dataset as one JSON file per collection plus
//!   `userSettings.json` under the configured base path.
//! - Use the primary file's `lastModified` as the remote version token.
//! - Migrate the legacy consolidated `data.json` layout once per target.
//!
//! # Invariants
//! - Every write is one commit whose parent is the commit the token was
//!   read from; the branch only moves if it still points at that parent.
//! - A moved branch is a version conflict and leaves every file untouched.
//! - Reads take all files from one commit.

use crate::clock::SharedClock;
use crate::model::app_data::{AppData, UserSettings};
use crate::model::record::{Collection, Record, Timestamp};
use crate::service::settings_store::SettingsStore;
use crate::sync::backend::{RemoteBackend, WriteOutcome};
use crate::sync::config::{BackendKind, GitHubConfig, SyncOptions};
use crate::sync::error::{SyncError, SyncResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, info, warn};
use reqwest::header::ACCEPT;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const GITHUB_API_BASE: &str = "https://api.github.com";
const GITHUB_API_VERSION: &str = "2022-11-28";
const PRIMARY_COLLECTION: Collection = Collection::Tasks;
const SETTINGS_FILE: &str = "userSettings.json";
const LEGACY_FILE: &str = "data.json";

/// One file of a pending commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWrite {
    pub path: String,
    pub content: String,
}

/// Result of a conditional commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { commit: String },
    /// The branch moved away from the expected parent.
    Conflict,
}

/// Transport seam over the repository contents and git data endpoints.
#[async_trait]
pub trait RepositoryApi: Send + Sync {
    /// Commit the branch points at; `None` when the branch does not exist.
    async fn head(&self) -> SyncResult<Option<String>>;

    /// Reads one file as of `commit`; `None` when it does not exist there.
    async fn get_file(&self, path: &str, commit: &str) -> SyncResult<Option<String>>;

    /// Commits `files` on top of `parent` and moves the branch only if it
    /// still points at `parent` (`None`: only if the branch is absent).
    async fn commit_files(
        &self,
        parent: Option<&str>,
        files: &[FileWrite],
        message: &str,
    ) -> SyncResult<CommitOutcome>;
}

/// `RepositoryApi` over the GitHub REST API.
pub struct HttpRepositoryApi {
    client: Client,
    api_base: String,
    owner: String,
    repo: String,
    branch: String,
    token: String,
}

#[derive(Deserialize)]
struct ContentsResponse {
    sha: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
}

#[derive(Deserialize)]
struct BlobResponse {
    content: String,
}

#[derive(Deserialize)]
struct ShaRef {
    sha: String,
}

#[derive(Deserialize)]
struct RefResponse {
    object: ShaRef,
}

#[derive(Deserialize)]
struct CommitResponse {
    tree: ShaRef,
}

#[derive(Serialize)]
struct TreeEntry<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct TreeRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    base_tree: Option<String>,
    tree: Vec<TreeEntry<'a>>,
}

#[derive(Serialize)]
struct CommitRequest<'a> {
    message: &'a str,
    tree: String,
    parents: Vec<&'a str>,
}

#[derive(Serialize)]
struct UpdateRefRequest<'a> {
    sha: &'a str,
    force: bool,
}

#[derive(Serialize)]
struct CreateRefRequest<'a> {
    #[serde(rename = "ref")]
    name: String,
    sha: &'a str,
}

impl HttpRepositoryApi {
    pub fn new(config: &GitHubConfig, options: &SyncOptions) -> SyncResult<Self> {
        let mut builder = Client::builder().user_agent(options.user_agent.as_str());
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| SyncError::Configuration(format!("http client: {err}")))?;

        Ok(Self {
            client,
            api_base: GITHUB_API_BASE.to_string(),
            owner: config.owner.trim().to_string(),
            repo: config.repo.trim().to_string(),
            branch: config.branch.trim().to_string(),
            token: config.token.trim().to_string(),
        })
    }

    /// Points the client at another API root (GitHub Enterprise).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
    }

    fn repo_url(&self, tail: &str) -> String {
        format!("{}/repos/{}/{}/{tail}", self.api_base, self.owner, self.repo)
    }

    /// Files above 1 MiB come back without inline content.
    async fn read_blob(&self, sha: &str) -> SyncResult<String> {
        let url = self.repo_url(&format!("git/blobs/{sha}"));
        let response = self.request(Method::GET, &url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "GET", &url));
        }
        let blob: BlobResponse = response.json().await?;
        decode_base64(&blob.content)
    }

    async fn tree_of(&self, commit: &str) -> SyncResult<String> {
        let url = self.repo_url(&format!("git/commits/{commit}"));
        let response = self.request(Method::GET, &url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "GET", &url));
        }
        let body: CommitResponse = response.json().await?;
        Ok(body.tree.sha)
    }

    async fn post_json<B: Serialize>(&self, tail: &str, body: &B) -> SyncResult<String> {
        let url = self.repo_url(tail);
        let response = self.request(Method::POST, &url).json(body).send().await?;
        let status = response.status();
        if status == StatusCode::CONFLICT {
            // The git data API refuses repositories without any commit.
            return Err(SyncError::Configuration(format!(
                "repository {}/{} has no commits yet",
                self.owner, self.repo
            )));
        }
        if !status.is_success() {
            return Err(status_error(status, "POST", tail));
        }
        let created: ShaRef = response.json().await?;
        Ok(created.sha)
    }
}

#[async_trait]
impl RepositoryApi for HttpRepositoryApi {
    async fn head(&self) -> SyncResult<Option<String>> {
        let url = self.repo_url(&format!("git/ref/heads/{}", self.branch));
        let response = self.request(Method::GET, &url).send().await?;
        let status = response.status();
        // 409: empty repository.
        if status == StatusCode::NOT_FOUND || status == StatusCode::CONFLICT {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, "GET", &url));
        }
        let body: RefResponse = response.json().await?;
        Ok(Some(body.object.sha))
    }

    async fn get_file(&self, path: &str, commit: &str) -> SyncResult<Option<String>> {
        let url = self.repo_url(&format!("contents/{path}"));
        let response = self
            .request(Method::GET, &url)
            .query(&[("ref", commit)])
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, "GET", path));
        }

        let body: ContentsResponse = response.json().await?;
        let content = match body.encoding.as_str() {
            "base64" => decode_base64(&body.content)?,
            "none" | "" => self.read_blob(&body.sha).await?,
            other => {
                return Err(SyncError::Validation(format!(
                    "{path} has unsupported encoding `{other}`"
                )))
            }
        };
        Ok(Some(content))
    }

    async fn commit_files(
        &self,
        parent: Option<&str>,
        files: &[FileWrite],
        message: &str,
    ) -> SyncResult<CommitOutcome> {
        let base_tree = match parent {
            Some(parent) => Some(self.tree_of(parent).await?),
            None => None,
        };
        let tree = TreeRequest {
            base_tree,
            tree: files
                .iter()
                .map(|file| TreeEntry {
                    path: &file.path,
                    mode: "100644",
                    kind: "blob",
                    content: &file.content,
                })
                .collect(),
        };
        let tree = self.post_json("git/trees", &tree).await?;
        let commit = CommitRequest {
            message,
            tree,
            parents: parent.into_iter().collect(),
        };
        let commit = self.post_json("git/commits", &commit).await?;

        let response = match parent {
            Some(_) => {
                let url = self.repo_url(&format!("git/refs/heads/{}", self.branch));
                self.request(Method::PATCH, &url)
                    .json(&UpdateRefRequest {
                        sha: &commit,
                        force: false,
                    })
                    .send()
                    .await?
            }
            None => {
                let url = self.repo_url("git/refs");
                self.request(Method::POST, &url)
                    .json(&CreateRefRequest {
                        name: format!("refs/heads/{}", self.branch),
                        sha: &commit,
                    })
                    .send()
                    .await?
            }
        };
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(CommitOutcome::Committed { commit }),
            // Not a fast-forward, or the branch already exists.
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => Ok(CommitOutcome::Conflict),
            StatusCode::NOT_FOUND => Err(SyncError::Configuration(format!(
                "repository or branch {} not found",
                self.branch
            ))),
            other => Err(status_error(other, "PATCH", "branch ref")),
        }
    }
}

fn status_error(status: StatusCode, op: &str, target: &str) -> SyncError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Configuration(format!(
            "GitHub rejected the token ({status}) on {op} {target}"
        )),
        other => SyncError::Network(format!("{op} {target} returned {other}")),
    }
}

fn decode_base64(encoded: &str) -> SyncResult<String> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(compact)
        .map_err(|err| SyncError::Validation(format!("invalid base64 content: {err}")))?;
    String::from_utf8(bytes)
        .map_err(|err| SyncError::Validation(format!("content is not UTF-8: {err}")))
}

/// On-repo shape of every split file.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileEnvelope<T> {
    #[serde(default)]
    last_modified: Option<Timestamp>,
    data: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileHeader {
    #[serde(default)]
    last_modified: Option<Timestamp>,
}


/// Split-file GitHub backend.
pub struct GitHubBackend {
    api: Arc<dyn RepositoryApi>,
    config: GitHubConfig,
    settings: Option<SettingsStore>,
    clock: SharedClock,
    migration_checked: AtomicBool,
}

impl GitHubBackend {
    pub fn new(api: Arc<dyn RepositoryApi>, config: GitHubConfig, clock: SharedClock) -> Self {
        Self {
            api,
            config,
            settings: None,
            clock,
            migration_checked: AtomicBool::new(false),
        }
    }

    /// Backend over the real GitHub API.
    pub fn from_config(
        config: GitHubConfig,
        options: &SyncOptions,
        clock: SharedClock,
    ) -> SyncResult<Self> {
        let api = HttpRepositoryApi::new(&config, options)?;
        Ok(Self::new(Arc::new(api), config, clock))
    }

    /// Persists migration markers through `settings`.
    pub fn with_settings(mut self, settings: SettingsStore) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn config(&self) -> &GitHubConfig {
        &self.config
    }

    fn primary_path(&self) -> String {
        self.config.file_path(&PRIMARY_COLLECTION.file_name())
    }

    async fn read_primary(&self, commit: &str) -> SyncResult<Option<(Timestamp, String)>> {
        let path = self.primary_path();
        let Some(content) = self.api.get_file(&path, commit).await? else {
            return Ok(None);
        };
        let header: FileHeader = parse_json(&path, &content)?;
        let last_modified = header
            .last_modified
            .ok_or_else(|| SyncError::Validation(format!("{path} has no lastModified")))?;
        Ok(Some((last_modified, content)))
    }

    async fn read_data<T: DeserializeOwned + Default>(
        &self,
        file_name: &str,
        commit: &str,
    ) -> SyncResult<T> {
        let path = self.config.file_path(file_name);
        match self.api.get_file(&path, commit).await? {
            Some(content) => {
                let envelope: FileEnvelope<T> = parse_json(&path, &content)?;
                Ok(envelope.data)
            }
            None => Ok(T::default()),
        }
    }

    /// Builds the files of one commit. With a `base` commit, secondary files
    /// whose data already matches it are left out; the primary file is
    /// always included so the version token moves.
    async fn files_to_commit(
        &self,
        snapshot: &AppData,
        stamp: Timestamp,
        base: Option<&str>,
    ) -> SyncResult<Vec<FileWrite>> {
        let mut secondary: Vec<(String, Value)> = Vec::new();
        for collection in Collection::ALL {
            if collection == PRIMARY_COLLECTION {
                continue;
            }
            secondary.push((
                collection.file_name(),
                serde_json::to_value(snapshot.collection(collection)).map_err(encode_error)?,
            ));
        }
        secondary.push((
            SETTINGS_FILE.to_string(),
            serde_json::to_value(&snapshot.user_settings).map_err(encode_error)?,
        ));

        let mut files = Vec::with_capacity(secondary.len() + 1);
        for (file_name, data) in secondary {
            let path = self.config.file_path(&file_name);
            if let Some(base) = base {
                let unchanged = self
                    .api
                    .get_file(&path, base)
                    .await?
                    .and_then(|content| serde_json::from_str::<FileEnvelope<Value>>(&content).ok())
                    .map_or(false, |envelope| envelope.data == data);
                if unchanged {
                    debug!("event=github_write module=github status=skipped path={path}");
                    continue;
                }
            }
            files.push(FileWrite {
                path,
                content: encode_envelope(stamp, &data)?,
            });
        }
        files.push(FileWrite {
            path: self.primary_path(),
            content: encode_envelope(stamp, snapshot.collection(PRIMARY_COLLECTION))?,
        });
        Ok(files)
    }

    async fn commit(
        &self,
        parent: Option<&str>,
        files: &[FileWrite],
        stamp: Timestamp,
    ) -> SyncResult<WriteOutcome> {
        let outcome = self
            .api
            .commit_files(parent, files, &commit_message(files))
            .await?;
        Ok(match outcome {
            CommitOutcome::Committed { commit } => {
                debug!(
                    "event=github_write module=github status=ok commit={commit} files={}",
                    files.len()
                );
                WriteOutcome::Written {
                    remote_timestamp: stamp,
                }
            }
            CommitOutcome::Conflict => {
                debug!("event=github_write module=github status=conflict reason=branch_moved");
                WriteOutcome::Conflict
            }
        })
    }

    fn outgoing_stamp(&self, snapshot: &AppData) -> Timestamp {
        snapshot.last_synced.unwrap_or_else(|| self.clock.now())
    }

    async fn migrate_legacy_layout(&self) -> SyncResult<()> {
        let Some(head) = self.api.head().await? else {
            return Ok(());
        };
        if self.api.get_file(&self.primary_path(), &head).await?.is_some() {
            return Ok(());
        }
        let legacy_path = self.config.file_path(LEGACY_FILE);
        let Some(legacy) = self.api.get_file(&legacy_path, &head).await? else {
            return Ok(());
        };

        let data: AppData = parse_json(&legacy_path, &legacy)?;
        data.validate()
            .map_err(|err| SyncError::Validation(format!("{legacy_path}: {err}")))?;
        let stamp = data.last_synced.unwrap_or_else(|| self.clock.now());
        let snapshot = data.with_watermark(Some(stamp));

        let files = self.files_to_commit(&snapshot, stamp, None).await?;
        if self.commit(Some(&head), &files, stamp).await? == WriteOutcome::Conflict {
            return Err(SyncError::VersionConflict(
                "remote changed during legacy layout migration".to_string(),
            ));
        }
        info!(
            "event=github_migration module=github status=ok records={}",
            snapshot.record_count()
        );
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for GitHubBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::GitHub
    }

    async fn prepare(&self) -> SyncResult<()> {
        if self.migration_checked.load(Ordering::Acquire) {
            return Ok(());
        }
        let target = self.config.target_key();
        let already_done = match &self.settings {
            Some(settings) => settings.github_migration_done(&target)?,
            None => false,
        };
        if !already_done {
            if let Err(err) = self.migrate_legacy_layout().await {
                warn!("event=github_migration module=github status=error error={err}");
                return Err(err);
            }
            if let Some(settings) = &self.settings {
                settings.mark_github_migration_done(&target)?;
            }
        }
        self.migration_checked.store(true, Ordering::Release);
        Ok(())
    }

    async fn read_remote_timestamp(
        &self,
        _local_watermark: Option<Timestamp>,
    ) -> SyncResult<Option<Timestamp>> {
        let Some(head) = self.api.head().await? else {
            return Ok(None);
        };
        Ok(self.read_primary(&head).await?.map(|(last_modified, _)| last_modified))
    }

    async fn read_remote_snapshot(
        &self,
        _local_watermark: Option<Timestamp>,
    ) -> SyncResult<Option<AppData>> {
        // Every file is read from the same commit.
        let Some(head) = self.api.head().await? else {
            return Ok(None);
        };
        let Some((last_modified, primary)) = self.read_primary(&head).await? else {
            return Ok(None);
        };
        let primary_path = self.primary_path();
        let primary: FileEnvelope<Vec<Record>> = parse_json(&primary_path, &primary)?;

        let mut snapshot = AppData::default();
        *snapshot.collection_mut(PRIMARY_COLLECTION) = primary.data;
        for collection in Collection::ALL {
            if collection == PRIMARY_COLLECTION {
                continue;
            }
            *snapshot.collection_mut(collection) =
                self.read_data(&collection.file_name(), &head).await?;
        }
        snapshot.user_settings = self.read_data::<UserSettings>(SETTINGS_FILE, &head).await?;
        snapshot.last_synced = Some(last_modified);
        Ok(Some(snapshot))
    }

    async fn write_remote_snapshot(
        &self,
        snapshot: &AppData,
        expected: Option<Timestamp>,
    ) -> SyncResult<WriteOutcome> {
        let head = self.api.head().await?;
        if let Some(head) = &head {
            if let Some((last_modified, _)) = self.read_primary(head).await? {
                if expected != Some(last_modified) {
                    debug!(
                        "event=github_write module=github status=conflict remote={}",
                        last_modified.to_rfc3339()
                    );
                    return Ok(WriteOutcome::Conflict);
                }
            }
        }

        let stamp = self.outgoing_stamp(snapshot);
        let files = self.files_to_commit(snapshot, stamp, head.as_deref()).await?;
        self.commit(head.as_deref(), &files, stamp).await
    }

    async fn force_write_remote_snapshot(&self, snapshot: &AppData) -> SyncResult<Timestamp> {
        let stamp = self.outgoing_stamp(snapshot);
        let head = self.api.head().await?;
        let files = self.files_to_commit(snapshot, stamp, head.as_deref()).await?;
        match self.commit(head.as_deref(), &files, stamp).await? {
            WriteOutcome::Written { remote_timestamp } => Ok(remote_timestamp),
            WriteOutcome::Conflict => Err(SyncError::VersionConflict(
                "remote changed during forced write".to_string(),
            )),
        }
    }
}

fn parse_json<T: DeserializeOwned>(path: &str, content: &str) -> SyncResult<T> {
    serde_json::from_str(content).map_err(|err| SyncError::Validation(format!("{path}: {err}")))
}

fn encode_envelope<T: Serialize>(stamp: Timestamp, data: T) -> SyncResult<String> {
    serde_json::to_string_pretty(&FileEnvelope {
        last_modified: Some(stamp),
        data,
    })
    .map_err(encode_error)
}

fn encode_error(err: serde_json::Error) -> SyncError {
    SyncError::Validation(format!("snapshot could not be encoded: {err}"))
}

fn commit_message(files: &[FileWrite]) -> String {
    let names: Vec<&str> = files
        .iter()
        .map(|file| file.path.rsplit('/').next().unwrap_or(&file.path))
        .collect();
    format!("lifesync: update {}", names.join(", "))
}

#[cfg(test)]
mod tests {
    use super::{CommitOutcome, FileWrite, GitHubBackend, RepositoryApi};
    use crate::clock::system_clock;
    use crate::db::open_db_in_memory;
    use crate::model::app_data::AppData;
    use crate::model::record::{Collection, Fields, Record};
    use crate::repo::state_repo::{share, SqliteStateRepository};
    use crate::service::settings_store::SettingsStore;
    use crate::sync::backend::{RemoteBackend, WriteOutcome};
    use crate::sync::config::GitHubConfig;
    use crate::sync::error::{SyncError, SyncResult};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    type Tree = HashMap<String, String>;

    /// Commit history of one branch.
    #[derive(Default)]
    struct MemoryRepo {
        commits: Mutex<HashMap<String, Tree>>,
        head: Mutex<Option<String>>,
        committed_paths: Mutex<Vec<Vec<String>>>,
        next_commit: Mutex<u64>,
        // Another writer's commit, landed when the given path is first read.
        interleaved: Mutex<Option<(String, Vec<FileWrite>)>>,
    }

    impl MemoryRepo {
        fn apply(&self, parent: Option<&str>, files: &[FileWrite]) -> CommitOutcome {
            let mut head = self.head.lock();
            if head.as_deref() != parent {
                return CommitOutcome::Conflict;
            }
            let mut tree = parent
                .and_then(|parent| self.commits.lock().get(parent).cloned())
                .unwrap_or_default();
            for file in files {
                tree.insert(file.path.clone(), file.content.clone());
            }
            let commit = {
                let mut next = self.next_commit.lock();
                *next += 1;
                format!("commit-{}", *next)
            };
            self.commits.lock().insert(commit.clone(), tree);
            *head = Some(commit.clone());
            self.committed_paths
                .lock()
                .push(files.iter().map(|file| file.path.clone()).collect());
            CommitOutcome::Committed { commit }
        }

        fn seed(&self, path: &str, content: &str) {
            let head = self.head.lock().clone();
            self.apply(
                head.as_deref(),
                &[FileWrite {
                    path: path.to_string(),
                    content: content.to_string(),
                }],
            );
        }

        fn commit_count(&self) -> usize {
            self.committed_paths.lock().len()
        }

        fn last_commit_paths(&self) -> Vec<String> {
            self.committed_paths.lock().last().cloned().unwrap_or_default()
        }

        fn file_at_head(&self, path: &str) -> Option<String> {
            let head = self.head.lock().clone()?;
            self.commits.lock().get(&head)?.get(path).cloned()
        }

        fn land_when_read(&self, path: &str, files: Vec<FileWrite>) {
            *self.interleaved.lock() = Some((path.to_string(), files));
        }
    }

    #[async_trait]
    impl RepositoryApi for MemoryRepo {
        async fn head(&self) -> SyncResult<Option<String>> {
            Ok(self.head.lock().clone())
        }

        async fn get_file(&self, path: &str, commit: &str) -> SyncResult<Option<String>> {
            let pending = {
                let mut slot = self.interleaved.lock();
                let fires = matches!(slot.as_ref(), Some((trigger, _)) if trigger == path);
                if fires {
                    slot.take()
                } else {
                    None
                }
            };
            if let Some((_, files)) = pending {
                let head = self.head.lock().clone();
                self.apply(head.as_deref(), &files);
            }
            Ok(self
                .commits
                .lock()
                .get(commit)
                .and_then(|tree| tree.get(path).cloned()))
        }

        async fn commit_files(
            &self,
            parent: Option<&str>,
            files: &[FileWrite],
            _message: &str,
        ) -> SyncResult<CommitOutcome> {
            Ok(self.apply(parent, files))
        }
    }

    fn backend(api: Arc<MemoryRepo>) -> GitHubBackend {
        GitHubBackend::new(api, GitHubConfig::new("tok", "me", "life"), system_clock())
    }

    fn titled(title: &str) -> Record {
        let mut fields = Fields::new();
        fields.insert("title".to_string(), title.into());
        Record::new(fields, Utc::now()).unwrap()
    }

    fn snapshot_with_task(title: &str) -> AppData {
        let mut data = AppData::default();
        data.tasks.push(titled(title));
        data
    }

    #[tokio::test]
    async fn first_push_is_one_commit_with_every_file() {
        let api = Arc::new(MemoryRepo::default());
        let backend = backend(api.clone());
        let stamp = Utc.with_ymd_and_hms(2024, 5, 5, 5, 5, 5).unwrap();
        let data = snapshot_with_task("write tests").with_watermark(Some(stamp));

        let outcome = backend.write_remote_snapshot(&data, None).await.unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Written {
                remote_timestamp: stamp
            }
        );

        assert_eq!(api.commit_count(), 1);
        let paths = api.last_commit_paths();
        assert_eq!(paths.len(), Collection::ALL.len() + 1);
        assert!(paths.iter().any(|path| path == "data/userSettings.json"));

        assert_eq!(backend.read_remote_timestamp(None).await.unwrap(), Some(stamp));
        let remote = backend.read_remote_snapshot(None).await.unwrap().unwrap();
        assert!(remote.content_eq(&data));
        assert_eq!(remote.last_synced, Some(stamp));
    }

    #[tokio::test]
    async fn stale_token_is_a_conflict_and_writes_nothing() {
        let api = Arc::new(MemoryRepo::default());
        let backend = backend(api.clone());
        let first = Utc.with_ymd_and_hms(2024, 5, 5, 5, 5, 5).unwrap();
        backend
            .write_remote_snapshot(&snapshot_with_task("a").with_watermark(Some(first)), None)
            .await
            .unwrap();
        let commits_before = api.commit_count();

        let stale = first - Duration::minutes(1);
        let outgoing = snapshot_with_task("b").with_watermark(Some(first + Duration::minutes(1)));
        let outcome = backend
            .write_remote_snapshot(&outgoing, Some(stale))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);
        assert_eq!(api.commit_count(), commits_before);

        // Never-synced device pushing onto existing data is also a conflict.
        let outcome = backend.write_remote_snapshot(&outgoing, None).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);
    }

    #[tokio::test]
    async fn push_landing_mid_write_leaves_the_other_device_data_intact() {
        let api = Arc::new(MemoryRepo::default());
        let backend = backend(api.clone());
        let t0 = Utc.with_ymd_and_hms(2024, 5, 5, 5, 5, 5).unwrap();
        backend
            .write_remote_snapshot(&snapshot_with_task("shared").with_watermark(Some(t0)), None)
            .await
            .unwrap();

        // Another device pushes tasks and projects while this one is still
        // reading the remote files it wants to replace.
        let t1 = t0 + Duration::minutes(1);
        let mut other = snapshot_with_task("device1");
        other.projects.push(titled("device1"));
        let other = other.with_watermark(Some(t1));
        let other_files = backend.files_to_commit(&other, t1, None).await.unwrap();
        api.land_when_read("data/projects.json", other_files);

        let mut mine = snapshot_with_task("device2");
        mine.projects.push(titled("device2"));
        let mine = mine.with_watermark(Some(t1 + Duration::minutes(1)));
        let outcome = backend.write_remote_snapshot(&mine, Some(t0)).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Conflict);

        let remote = backend.read_remote_snapshot(None).await.unwrap().unwrap();
        assert!(remote.content_eq(&other));
        assert_eq!(remote.last_synced, Some(t1));
    }

    #[tokio::test]
    async fn unchanged_files_are_left_out_of_later_commits() {
        let api = Arc::new(MemoryRepo::default());
        let backend = backend(api.clone());
        let first = Utc.with_ymd_and_hms(2024, 5, 5, 5, 5, 5).unwrap();
        let data = snapshot_with_task("a");
        backend
            .write_remote_snapshot(&data.with_watermark(Some(first)), None)
            .await
            .unwrap();

        let mut next = data.clone();
        next.goals.push(Record::new(Fields::new(), Utc::now()).unwrap());
        let second = first + Duration::seconds(10);
        backend
            .write_remote_snapshot(&next.with_watermark(Some(second)), Some(first))
            .await
            .unwrap();

        assert_eq!(api.commit_count(), 2);
        assert_eq!(
            api.last_commit_paths(),
            vec!["data/goals.json".to_string(), "data/tasks.json".to_string()]
        );
        assert_eq!(backend.read_remote_timestamp(None).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn missing_secondary_files_read_as_empty() {
        let api = Arc::new(MemoryRepo::default());
        api.seed(
            "data/tasks.json",
            r#"{"lastModified": "2024-01-01T00:00:00Z", "data": []}"#,
        );
        let remote = backend(api).read_remote_snapshot(None).await.unwrap().unwrap();
        assert_eq!(remote.record_count(), 0);
        assert!(remote.last_synced.is_some());
    }

    #[tokio::test]
    async fn malformed_primary_file_is_a_validation_error() {
        let api = Arc::new(MemoryRepo::default());
        api.seed("data/tasks.json", "not json");
        let err = backend(api).read_remote_timestamp(None).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn force_write_ignores_the_version_token() {
        let api = Arc::new(MemoryRepo::default());
        let backend = backend(api.clone());
        let first = Utc.with_ymd_and_hms(2024, 5, 5, 5, 5, 5).unwrap();
        backend
            .write_remote_snapshot(&snapshot_with_task("remote").with_watermark(Some(first)), None)
            .await
            .unwrap();

        let forced_at = first + Duration::hours(1);
        let local = snapshot_with_task("local").with_watermark(Some(forced_at));
        let stamp = backend.force_write_remote_snapshot(&local).await.unwrap();
        assert_eq!(stamp, forced_at);
        let remote = backend.read_remote_snapshot(None).await.unwrap().unwrap();
        assert!(remote.content_eq(&local));
    }

    #[tokio::test]
    async fn forced_write_losing_a_race_is_a_version_conflict() {
        let api = Arc::new(MemoryRepo::default());
        let backend = backend(api.clone());
        let first = Utc.with_ymd_and_hms(2024, 5, 5, 5, 5, 5).unwrap();
        let remote = snapshot_with_task("remote").with_watermark(Some(first));
        backend.write_remote_snapshot(&remote, None).await.unwrap();

        let racing = snapshot_with_task("racing").with_watermark(Some(first + Duration::hours(1)));
        let racing_files = backend
            .files_to_commit(&racing, first + Duration::hours(1), None)
            .await
            .unwrap();
        api.land_when_read("data/goals.json", racing_files);

        let local = snapshot_with_task("local").with_watermark(Some(first + Duration::hours(2)));
        let err = backend.force_write_remote_snapshot(&local).await.unwrap_err();
        assert!(matches!(err, SyncError::VersionConflict(_)));
        let remote = backend.read_remote_snapshot(None).await.unwrap().unwrap();
        assert!(remote.content_eq(&racing));
    }

    #[tokio::test]
    async fn legacy_data_json_is_split_once() {
        let api = Arc::new(MemoryRepo::default());
        let legacy = snapshot_with_task("legacy")
            .with_watermark(Some(Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap()));
        api.seed("data/data.json", &serde_json::to_string(&legacy).unwrap());

        let repo = SqliteStateRepository::try_new(open_db_in_memory().unwrap()).unwrap();
        let settings = SettingsStore::new(share(repo));
        let config = GitHubConfig::new("tok", "me", "life");
        let target = config.target_key();
        let backend = GitHubBackend::new(api.clone(), config.clone(), system_clock())
            .with_settings(settings.clone());

        backend.prepare().await.unwrap();
        assert!(settings.github_migration_done(&target).unwrap());
        let remote = backend.read_remote_snapshot(None).await.unwrap().unwrap();
        assert!(remote.content_eq(&legacy));
        assert_eq!(remote.last_synced, legacy.last_synced);
        // Seed plus one migration commit.
        assert_eq!(api.commit_count(), 2);

        // A fresh adapter for the same target trusts the persisted marker.
        let again = GitHubBackend::new(api.clone(), config, system_clock()).with_settings(settings);
        again.prepare().await.unwrap();
        assert_eq!(api.commit_count(), 2);
        assert!(api.file_at_head("data/data.json").is_some());
    }
}
