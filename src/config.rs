//! Process-wide service configuration.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Every field has a default, so a missing config file (or an empty one) is
//! not an error — see [`ServiceConfig::default`].
//!
//! Distinct from [`crate::settings::Settings`], which is per-run and
//! resolved from the first `RunStart` record rather than from disk.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Resolved config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub cache: CacheConfig,
    pub transfer: TransferConfig,
    pub backoff: BackoffConfig,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Base directory for the content-addressed file cache. `None` resolves
    /// to the platform user cache directory at open time.
    pub dir: Option<String>,
    /// Skip storing file content in the cache entirely; only digests are
    /// tracked, and every restore is a miss.
    pub hash_only: bool,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub default_concurrency: usize,
    pub s3_concurrency: usize,
    pub gcs_concurrency: usize,
    pub azure_concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            cache: CacheConfig { dir: None, hash_only: false },
            transfer: TransferConfig {
                default_concurrency: 64,
                s3_concurrency: 200,
                gcs_concurrency: 200,
                azure_concurrency: 500,
            },
            backoff: BackoffConfig {
                initial_delay_ms: 200,
                max_delay_ms: 30_000,
                max_retries: 6,
            },
            log_level: "info".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (all-Option, resolved into ServiceConfig)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    cache: Option<RawCacheConfig>,
    transfer: Option<RawTransferConfig>,
    backoff: Option<RawBackoffConfig>,
    log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCacheConfig {
    dir: Option<String>,
    hash_only: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawTransferConfig {
    default_concurrency: Option<usize>,
    s3_concurrency: Option<usize>,
    gcs_concurrency: Option<usize>,
    azure_concurrency: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawBackoffConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_retries: Option<u32>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load the service config from `path`, falling back to defaults field by
/// field for anything the file omits. A missing file is not an error (it is
/// treated the same as an empty file); a malformed one is.
pub fn load_config_from_path(path: &Path) -> Result<ServiceConfig, ConfigError> {
    if !path.exists() {
        return Ok(ServiceConfig::default());
    }
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<ServiceConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = ServiceConfig::default();

    let cache = match raw.cache {
        Some(c) => CacheConfig {
            dir: c.dir,
            hash_only: c.hash_only.unwrap_or(defaults.cache.hash_only),
        },
        None => defaults.cache,
    };
    let transfer = match raw.transfer {
        Some(t) => TransferConfig {
            default_concurrency: t.default_concurrency.unwrap_or(defaults.transfer.default_concurrency),
            s3_concurrency: t.s3_concurrency.unwrap_or(defaults.transfer.s3_concurrency),
            gcs_concurrency: t.gcs_concurrency.unwrap_or(defaults.transfer.gcs_concurrency),
            azure_concurrency: t.azure_concurrency.unwrap_or(defaults.transfer.azure_concurrency),
        },
        None => defaults.transfer,
    };
    let backoff = match raw.backoff {
        Some(b) => BackoffConfig {
            initial_delay_ms: b.initial_delay_ms.unwrap_or(defaults.backoff.initial_delay_ms),
            max_delay_ms: b.max_delay_ms.unwrap_or(defaults.backoff.max_delay_ms),
            max_retries: b.max_retries.unwrap_or(defaults.backoff.max_retries),
        },
        None => defaults.backoff,
    };

    Ok(ServiceConfig {
        cache,
        transfer,
        backoff,
        log_level: raw.log_level.unwrap_or(defaults.log_level),
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "parse error: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_resolves_to_defaults() {
        let cfg = load_config_from_str("").unwrap();
        assert_eq!(cfg.transfer.azure_concurrency, 500);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let cfg = load_config_from_str(
            r#"
            log_level = "debug"

            [transfer]
            default_concurrency = 8
            "#,
        )
        .unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.transfer.default_concurrency, 8);
        assert_eq!(cfg.transfer.azure_concurrency, 500);
    }

    #[test]
    fn malformed_toml_is_rejected() {
        let err = load_config_from_str("not valid [[[ toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load_config_from_path(Path::new("/nonexistent/path/core-service.toml")).unwrap();
        assert_eq!(cfg.backoff.max_retries, 6);
    }
}
