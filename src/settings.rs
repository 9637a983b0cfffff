//! Per-run settings: a frozen struct resolved once from the first
//! `RunStart` record plus the process-wide [`crate::config::ServiceConfig`].
//!
//! `Stream` holds a `Settings` by value and never exposes a setter; every
//! field here is fixed for the lifetime of the run.

use crate::config::ServiceConfig;
use proto::RunStartRecord;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Settings {
    pub run_id: String,
    pub project: String,
    pub entity: Option<String>,
    pub base_url: String,
    /// Offline runs are journaled but not transmitted (except `AlwaysSend`).
    pub offline: bool,
    /// Sync mode: this Stream exists only to replay an on-disk journal
    /// against the remote; the store is skipped entirely (see `Writer`).
    pub sync: bool,
    pub files_dir: PathBuf,
    pub journal_path: PathBuf,
    pub cache_dir: PathBuf,
    pub cache_hash_only: bool,
}

pub struct SettingsParams<'a> {
    pub run_start: &'a RunStartRecord,
    pub base_url: String,
    pub offline: bool,
    pub sync: bool,
    pub run_dir: PathBuf,
    pub config: &'a ServiceConfig,
}

impl Settings {
    pub fn resolve(params: SettingsParams<'_>) -> Self {
        let files_dir = params.run_dir.join("files");
        let journal_path = params.run_dir.join("run.log");
        Settings {
            run_id: params.run_start.run_id.clone(),
            project: params.run_start.project.clone(),
            entity: params.run_start.entity.clone(),
            base_url: params.base_url,
            offline: params.offline,
            sync: params.sync,
            files_dir,
            journal_path,
            cache_dir: match params.config.cache.dir.clone() {
                Some(dir) => PathBuf::from(dir),
                None => dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".")).join("core-service"),
            },
            cache_hash_only: params.config.cache.hash_only,
        }
    }
}
