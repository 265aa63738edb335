//! Backend configuration, backend detection and sync tuning options.
//!
//! # Responsibility
//! - Define the persisted configuration of each remote backend.
//! - Decide which backend is active from configuration alone.
//!
//! # Invariants
//! - GitHub wins over Cloudflare when both are fully configured.
//! - Incomplete configuration never selects a backend.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;

static REPO_SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("valid repo segment regex"));

/// Quiet period between the last change and the debounced sync.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(3000);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_GITHUB_BRANCH: &str = "main";
pub const DEFAULT_GITHUB_BASE_PATH: &str = "data";

/// Which remote the orchestrator talks to.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    None,
    GitHub,
    Cloudflare,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::GitHub => "github",
            Self::Cloudflare => "cloudflare",
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_branch() -> String {
    DEFAULT_GITHUB_BRANCH.to_string()
}

fn default_base_path() -> String {
    DEFAULT_GITHUB_BASE_PATH.to_string()
}

/// Credentials and location of the GitHub repository holding the data.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubConfig {
    pub token: String,
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

impl GitHubConfig {
    pub fn new(
        token: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            owner: owner.into(),
            repo: repo.into(),
            branch: default_branch(),
            base_path: default_base_path(),
        }
    }

    /// Token, owner and repo are present and owner/repo are valid names.
    pub fn is_complete(&self) -> bool {
        !self.token.trim().is_empty()
            && REPO_SEGMENT_RE.is_match(self.owner.trim())
            && REPO_SEGMENT_RE.is_match(self.repo.trim())
    }

    /// Base path without leading/trailing slashes; empty means repo root.
    pub fn normalized_base_path(&self) -> String {
        self.base_path.trim().trim_matches('/').to_string()
    }

    /// Repository path of one file under the base path.
    pub fn file_path(&self, file_name: &str) -> String {
        let base = self.normalized_base_path();
        if base.is_empty() {
            file_name.to_string()
        } else {
            format!("{base}/{file_name}")
        }
    }

    /// Stable identity of the storage target, used for migration markers.
    pub fn target_key(&self) -> String {
        format!(
            "{}/{}@{}:{}",
            self.owner.trim(),
            self.repo.trim(),
            self.branch.trim(),
            self.normalized_base_path()
        )
    }
}

// Keeps the token out of logs and panic messages.
impl std::fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("token", &"<redacted>")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .field("base_path", &self.base_path)
            .finish()
    }
}

/// Location and optional key of the Cloudflare-style sync endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudflareConfig {
    pub endpoint_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl CloudflareConfig {
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            api_key: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        let url = self.endpoint_url.trim();
        url.starts_with("https://") || url.starts_with("http://")
    }

    /// Endpoint URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.endpoint_url.trim().trim_end_matches('/')
    }

    /// Non-blank API key, if any.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

impl std::fmt::Debug for CloudflareConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Persisted configuration of every backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSettings {
    pub github: Option<GitHubConfig>,
    pub cloudflare: Option<CloudflareConfig>,
}

impl BackendSettings {
    /// GitHub if fully populated, else Cloudflare if its URL is present,
    /// else none.
    pub fn detect(&self) -> BackendKind {
        if self.github.as_ref().is_some_and(GitHubConfig::is_complete) {
            return BackendKind::GitHub;
        }
        if self
            .cloudflare
            .as_ref()
            .is_some_and(CloudflareConfig::is_complete)
        {
            return BackendKind::Cloudflare;
        }
        BackendKind::None
    }
}

/// Tuning knobs of the orchestrator and HTTP transports.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub debounce: Duration,
    pub request_timeout: Option<Duration>,
    pub user_agent: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            user_agent: format!("lifesync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BackendKind, BackendSettings, CloudflareConfig, GitHubConfig};

    #[test]
    fn github_wins_when_fully_configured() {
        let settings = BackendSettings {
            github: Some(GitHubConfig::new("tok", "me", "life-data")),
            cloudflare: Some(CloudflareConfig::new("https://sync.example.dev")),
        };
        assert_eq!(settings.detect(), BackendKind::GitHub);
    }

    #[test]
    fn partial_github_falls_back_to_cloudflare() {
        let settings = BackendSettings {
            github: Some(GitHubConfig::new("", "me", "life-data")),
            cloudflare: Some(CloudflareConfig::new("https://sync.example.dev")),
        };
        assert_eq!(settings.detect(), BackendKind::Cloudflare);
    }

    #[test]
    fn nothing_configured_detects_none() {
        assert_eq!(BackendSettings::default().detect(), BackendKind::None);
        let settings = BackendSettings {
            github: Some(GitHubConfig::new("tok", "bad owner", "repo")),
            cloudflare: Some(CloudflareConfig::new("   ")),
        };
        assert_eq!(settings.detect(), BackendKind::None);
    }

    #[test]
    fn file_path_normalizes_base_path() {
        let mut config = GitHubConfig::new("tok", "me", "repo");
        config.base_path = "/app/data/".to_string();
        assert_eq!(config.file_path("tasks.json"), "app/data/tasks.json");
        config.base_path = String::new();
        assert_eq!(config.file_path("tasks.json"), "tasks.json");
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = GitHubConfig::new("ghp_secret", "me", "repo");
        assert!(!format!("{config:?}").contains("ghp_secret"));
        let mut cloudflare = CloudflareConfig::new("https://sync.example.dev");
        cloudflare.api_key = Some("k-secret".to_string());
        assert!(!format!("{cloudflare:?}").contains("k-secret"));
    }
}
