//! Typed client for the remote backend, with jittered exponential backoff
//! retry around idempotent requests.
//!
//! Non-idempotent requests (the ones that create server-side state, like
//! starting a run) are sent once: retrying them risks double-creation, and
//! the caller is better positioned to decide what to do with a failure.

use crate::config::BackoffConfig;
use proto::{Manifest, RunStartRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server returned status {0}: {1}")]
    BadStatus(reqwest::StatusCode, String),
}

#[derive(Debug, Serialize)]
struct RunStartPayload<'a> {
    run_id: &'a str,
    project: &'a str,
    entity: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RunStartResponse {
    run_id: String,
}

#[derive(Debug, Serialize)]
struct FileUrlsRequest<'a> {
    paths: &'a [String],
}

#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    backoff: BackoffConfig,
}

impl RemoteClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, backoff: BackoffConfig) -> Self {
        RemoteClient {
            http,
            base_url: base_url.into(),
            backoff,
        }
    }

    /// Register a run. Sent once; the caller surfaces failure to the user
    /// rather than silently retrying a state-creating call.
    pub async fn run_start(&self, run_start: &RunStartRecord) -> Result<String, RemoteError> {
        let url = format!("{}/runs/start", self.base_url);
        let payload = RunStartPayload {
            run_id: &run_start.run_id,
            project: &run_start.project,
            entity: run_start.entity.as_deref(),
        };
        let response = self.http.post(&url).json(&payload).send().await?;
        let response = Self::check_status(response).await?;
        let body: RunStartResponse = response.json().await?;
        Ok(body.run_id)
    }

    /// Push one batch of history rows. Idempotent from the server's point
    /// of view (rows are keyed by run + step), so retried on failure.
    pub async fn push_history(&self, run_id: &str, rows: &serde_json::Value) -> Result<(), RemoteError> {
        let url = format!("{}/runs/{run_id}/history", self.base_url);
        self.with_retry(|| async {
            let response = self.http.post(&url).json(rows).send().await?;
            Self::check_status(response).await?;
            Ok(())
        })
        .await
    }

    pub async fn push_summary(&self, run_id: &str, summary: &serde_json::Value) -> Result<(), RemoteError> {
        let url = format!("{}/runs/{run_id}/summary", self.base_url);
        self.with_retry(|| async {
            let response = self.http.post(&url).json(summary).send().await?;
            Self::check_status(response).await?;
            Ok(())
        })
        .await
    }

    pub async fn fetch_manifest(&self, artifact_id: &str) -> Result<Manifest, RemoteError> {
        let url = format!("{}/artifacts/{artifact_id}/manifest", self.base_url);
        self.with_retry(|| async {
            let response = self.http.get(&url).send().await?;
            let response = Self::check_status(response).await?;
            Ok(response.json::<Manifest>().await?)
        })
        .await
    }

    /// Resolve a batch of manifest logical paths to signed, time-limited
    /// download URLs. One round trip covers the whole batch; entries the
    /// server has nothing for are simply absent from the returned map.
    pub async fn resolve_file_urls(
        &self,
        artifact_id: &str,
        logical_paths: &[String],
    ) -> Result<BTreeMap<String, String>, RemoteError> {
        let url = format!("{}/artifacts/{artifact_id}/file_urls", self.base_url);
        self.with_retry(|| async {
            let response = self.http.post(&url).json(&FileUrlsRequest { paths: logical_paths }).send().await?;
            let response = Self::check_status(response).await?;
            Ok(response.json::<BTreeMap<String, String>>().await?)
        })
        .await
    }

    /// Base URL for building request paths the caller assembles itself
    /// (file upload URLs, which depend on more than just a run id).
    pub fn base_url_for_uploads(&self) -> String {
        self.base_url.clone()
    }

    pub async fn mark_exit(&self, run_id: &str, exit_code: i32) -> Result<(), RemoteError> {
        let url = format!("{}/runs/{run_id}/exit", self.base_url);
        self.with_retry(|| async {
            let response = self
                .http
                .post(&url)
                .json(&serde_json::json!({ "exit_code": exit_code }))
                .send()
                .await?;
            Self::check_status(response).await?;
            Ok(())
        })
        .await
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::BadStatus(status, body))
        }
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RemoteError>>,
    {
        let mut delay_ms = self.backoff.initial_delay_ms;
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.backoff.max_retries => return Err(e),
                Err(_) => {
                    attempt += 1;
                    let jitter = rand::random::<u64>() % (delay_ms / 2 + 1);
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(self.backoff.max_delay_ms);
                }
            }
        }
    }
}
