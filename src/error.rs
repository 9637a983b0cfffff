//! Top-level fatal error type and the crash-reporter seam.
//!
//! Most errors in this crate are module-local (`JournalError`, `TransferError`,
//! `CacheError`, ...) and are recovered from without tearing down the process. The small
//! set collected here are the ones that justify exiting non-zero at startup
//! or at shutdown.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("failed to open transaction log at {path}: {source}")]
    JournalOpen {
        path: PathBuf,
        #[source]
        source: crate::store::JournalError,
    },
    #[error("journal degraded: {0} append(s) failed during the run")]
    JournalDegraded(u64),
    #[error("failed to bind IPC listener: {0}")]
    BindListener(#[source] std::io::Error),
    #[error("failed to write port file at {path}: {source}")]
    PortFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load service config: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Abstraction over the out-of-scope third-party crash-reporting SaaS.
///
/// `main` constructs a [`LoggingCrashReporter`] unless `--no-observability`
/// is passed, in which case a no-op reporter is used instead.
pub trait CrashReporter: Send + Sync {
    fn report_fatal(&self, error: &FatalError);
}

pub struct LoggingCrashReporter;

impl CrashReporter for LoggingCrashReporter {
    fn report_fatal(&self, error: &FatalError) {
        tracing::error!(error = %error, "fatal error reported to crash reporter");
    }
}

pub struct NoopCrashReporter;

impl CrashReporter for NoopCrashReporter {
    fn report_fatal(&self, _error: &FatalError) {}
}
