//! Persistence boundary for job tokens.
//!
//! A [`Backend`] stores one record per job id (the token) plus any number of
//! out-of-line blobs keyed by `(job id, field key)`. It knows nothing about
//! stages; the engine decides what to persist and when.
//!
//! ## Implementations
//!
//! - [`InMemoryBackend`]: tests/dev
//! - [`FilesystemBackend`]: one directory per job under a base directory
//! - `PostgresBackend`: behind the `postgres` feature

pub mod filesystem;
pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use stepwise_core::{JobId, Token};

use crate::config::DEFAULT_CLEANUP_AGE;

pub use filesystem::FilesystemBackend;
pub use in_memory::InMemoryBackend;
#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;

/// Backend operation error.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("blob not found: {id}/{key}")]
    BlobNotFound { id: JobId, key: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl BackendError {
    pub fn storage(context: impl core::fmt::Display, err: impl core::fmt::Display) -> Self {
        Self::Storage(format!("{context}: {err}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::BlobNotFound { .. })
    }
}

/// A persisted job as seen by the cleanup sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEntry {
    pub id: JobId,
    pub updated_at: DateTime<Utc>,
}

/// A record the sweep could not inspect or remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    /// Job id, or the raw storage name when it is not a valid id.
    pub job: String,
    pub error: String,
}

/// Outcome of a cleanup sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<JobId>,
    pub failed: Vec<CleanupFailure>,
}

impl CleanupReport {
    /// Number of jobs removed.
    pub fn count(&self) -> usize {
        self.removed.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Token storage abstraction.
///
/// Calls for the same id are expected to be serialized by the caller (at most
/// one in-flight engine call per job). Implementations must make `save`
/// atomic: a concurrent `load` sees either the previous or the new record.
pub trait Backend: Send + Sync {
    /// Load the persisted token for `id`.
    fn load(&self, id: &JobId) -> Result<Token, BackendError>;

    /// Persist `token` as the current state of `id`, stamping the
    /// last-modified time.
    fn save(&self, id: &JobId, token: &Token) -> Result<(), BackendError>;

    /// Remove the job's state and all of its blobs. Idempotent.
    fn delete(&self, id: &JobId) -> Result<(), BackendError>;

    /// Store `bytes` out-of-line under `(id, key)`, replacing any previous blob.
    fn store_blob(&self, id: &JobId, key: &str, bytes: &[u8]) -> Result<(), BackendError>;

    /// Fetch the blob stored under `(id, key)`.
    fn fetch_blob(&self, id: &JobId, key: &str) -> Result<Vec<u8>, BackendError>;

    /// Enumerate persisted jobs with their last-modified time.
    ///
    /// Individual records that cannot be inspected are returned as `Err`
    /// entries so a sweep can report them and carry on.
    fn list(&self) -> Result<Vec<Result<JobEntry, CleanupFailure>>, BackendError>;

    /// Scalar values whose encoded size exceeds this many bytes are stored
    /// as blobs. 0 disables auto-blobbing.
    fn auto_blob_threshold(&self) -> usize {
        0
    }

    /// Age after which an untouched job is considered abandoned.
    fn cleanup_age(&self) -> Duration {
        DEFAULT_CLEANUP_AGE
    }

    /// Remove every job last modified more than `age_threshold` ago.
    fn cleanup(&self, age_threshold: Duration) -> Result<CleanupReport, BackendError> {
        let cutoff = TimeDelta::from_std(age_threshold)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.cleanup_before(cutoff)
    }

    /// Remove every job whose last-modified time is strictly before `cutoff`.
    fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<CleanupReport, BackendError> {
        let mut report = CleanupReport::default();

        for listed in self.list()? {
            match listed {
                Ok(entry) if entry.updated_at < cutoff => match self.delete(&entry.id) {
                    Ok(()) => {
                        debug!(job_id = %entry.id, updated_at = %entry.updated_at, "removed stale job");
                        report.removed.push(entry.id);
                    }
                    Err(e) => {
                        warn!(job_id = %entry.id, error = %e, "failed to remove stale job");
                        report.failed.push(CleanupFailure {
                            job: entry.id.to_string(),
                            error: e.to_string(),
                        });
                    }
                },
                Ok(_) => {}
                Err(failure) => {
                    warn!(job = %failure.job, error = %failure.error, "skipping unreadable job record");
                    report.failed.push(failure);
                }
            }
        }

        Ok(report)
    }
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn load(&self, id: &JobId) -> Result<Token, BackendError> {
        (**self).load(id)
    }

    fn save(&self, id: &JobId, token: &Token) -> Result<(), BackendError> {
        (**self).save(id, token)
    }

    fn delete(&self, id: &JobId) -> Result<(), BackendError> {
        (**self).delete(id)
    }

    fn store_blob(&self, id: &JobId, key: &str, bytes: &[u8]) -> Result<(), BackendError> {
        (**self).store_blob(id, key, bytes)
    }

    fn fetch_blob(&self, id: &JobId, key: &str) -> Result<Vec<u8>, BackendError> {
        (**self).fetch_blob(id, key)
    }

    fn list(&self) -> Result<Vec<Result<JobEntry, CleanupFailure>>, BackendError> {
        (**self).list()
    }

    fn auto_blob_threshold(&self) -> usize {
        (**self).auto_blob_threshold()
    }

    fn cleanup_age(&self) -> Duration {
        (**self).cleanup_age()
    }

    fn cleanup(&self, age_threshold: Duration) -> Result<CleanupReport, BackendError> {
        (**self).cleanup(age_threshold)
    }

    fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<CleanupReport, BackendError> {
        (**self).cleanup_before(cutoff)
    }
}
