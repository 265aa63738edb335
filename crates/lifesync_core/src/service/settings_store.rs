//! Backend configuration store.
//!
//! # Responsibility
//! - Persist one small JSON blob per backend, separate from the dataset.
//! - Track one-time remote migrations per storage target.
//!
//! # Invariants
//! - Configuration blobs never share a key with the dataset snapshot.
//! - Credentials are never logged.

use crate::repo::state_repo::{RepoResult, SharedStateRepository, SyncRunRecord};
use crate::sync::config::{BackendSettings, CloudflareConfig, GitHubConfig};
use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const GITHUB_CONFIG_KEY: &str = "backend.github";
pub const CLOUDFLARE_CONFIG_KEY: &str = "backend.cloudflare";
const MIGRATION_MARKER_PREFIX: &str = "migration.github_split:";

/// Typed access to backend configuration blobs.
#[derive(Clone)]
pub struct SettingsStore {
    repo: SharedStateRepository,
}

impl SettingsStore {
    pub fn new(repo: SharedStateRepository) -> Self {
        Self { repo }
    }

    /// Loads the configuration of every backend.
    pub fn load(&self) -> RepoResult<BackendSettings> {
        Ok(BackendSettings {
            github: self.load_json(GITHUB_CONFIG_KEY)?,
            cloudflare: self.load_json(CLOUDFLARE_CONFIG_KEY)?,
        })
    }

    pub fn save_github(&self, config: &GitHubConfig) -> RepoResult<()> {
        self.save_json(GITHUB_CONFIG_KEY, config)?;
        info!(
            "event=config_save module=settings status=ok backend=github complete={}",
            config.is_complete()
        );
        Ok(())
    }

    pub fn save_cloudflare(&self, config: &CloudflareConfig) -> RepoResult<()> {
        self.save_json(CLOUDFLARE_CONFIG_KEY, config)?;
        info!(
            "event=config_save module=settings status=ok backend=cloudflare complete={}",
            config.is_complete()
        );
        Ok(())
    }

    /// Removes every backend configuration.
    pub fn clear(&self) -> RepoResult<()> {
        let repo = self.repo.lock();
        repo.delete_value(GITHUB_CONFIG_KEY)?;
        repo.delete_value(CLOUDFLARE_CONFIG_KEY)?;
        info!("event=config_clear module=settings status=ok");
        Ok(())
    }

    /// Whether the split-file migration already ran for `target`.
    pub fn github_migration_done(&self, target: &str) -> RepoResult<bool> {
        Ok(self
            .repo
            .lock()
            .load_value(&migration_key(target))?
            .is_some())
    }

    pub fn mark_github_migration_done(&self, target: &str) -> RepoResult<()> {
        self.repo.lock().save_value(&migration_key(target), "done")
    }

    pub fn record_sync_run(&self, run: &SyncRunRecord) -> RepoResult<()> {
        self.repo.lock().record_sync_run(run)
    }

    pub fn recent_sync_runs(&self, limit: u32) -> RepoResult<Vec<SyncRunRecord>> {
        self.repo.lock().recent_sync_runs(limit)
    }

    fn load_json<T: DeserializeOwned>(&self, key: &str) -> RepoResult<Option<T>> {
        let raw = self.repo.lock().load_value(key)?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn save_json<T: Serialize>(&self, key: &str, value: &T) -> RepoResult<()> {
        let raw = serde_json::to_string(value)?;
        self.repo.lock().save_value(key, &raw)
    }
}

fn migration_key(target: &str) -> String {
    format!("{MIGRATION_MARKER_PREFIX}{target}")
}
