use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use stepwise_core::{JobId, Token};

use super::{Backend, BackendError, CleanupFailure, JobEntry};
use crate::config::{BackendConfig, DEFAULT_CLEANUP_AGE};

#[derive(Debug, Clone)]
struct StoredToken {
    token: Token,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BlobSet {
    blobs: HashMap<String, Vec<u8>>,
    updated_at: Option<DateTime<Utc>>,
}

/// In-memory token store.
///
/// Intended for tests/dev. Blobs are kept separately from token records so
/// they can be written before the first `save` of a fresh job.
#[derive(Debug)]
pub struct InMemoryBackend {
    tokens: RwLock<HashMap<JobId, StoredToken>>,
    blobs: RwLock<HashMap<JobId, BlobSet>>,
    auto_blob_threshold: usize,
    cleanup_age: Duration,
}

impl InMemoryBackend {
    /// A backend with auto-blobbing disabled.
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            blobs: RwLock::new(HashMap::new()),
            auto_blob_threshold: 0,
            cleanup_age: DEFAULT_CLEANUP_AGE,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            auto_blob_threshold: config.auto_blob_threshold,
            cleanup_age: config.cleanup_age,
            ..Self::new()
        }
    }

    pub fn with_auto_blob_threshold(mut self, threshold: usize) -> Self {
        self.auto_blob_threshold = threshold;
        self
    }

    /// Whether a token record exists for `id`.
    pub fn contains(&self, id: &JobId) -> bool {
        self.read_tokens().is_ok_and(|t| t.contains_key(id))
    }

    /// Number of persisted token records.
    pub fn len(&self) -> usize {
        self.read_tokens().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of blobs held for `id`.
    pub fn blob_count(&self, id: &JobId) -> usize {
        self.blobs
            .read()
            .ok()
            .and_then(|b| b.get(id).map(|set| set.blobs.len()))
            .unwrap_or(0)
    }

    /// Pretend `id` was last written at `at`.
    #[cfg(test)]
    pub(crate) fn set_updated_at(&self, id: &JobId, at: DateTime<Utc>) {
        if let Ok(mut tokens) = self.tokens.write() {
            if let Some(stored) = tokens.get_mut(id) {
                stored.updated_at = at;
            }
        }
        if let Ok(mut blobs) = self.blobs.write() {
            if let Some(set) = blobs.get_mut(id) {
                set.updated_at = Some(at);
            }
        }
    }

    fn read_tokens(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, StoredToken>>, BackendError> {
        self.tokens
            .read()
            .map_err(|_| BackendError::Storage("lock poisoned".to_string()))
    }

    fn write_tokens(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<JobId, StoredToken>>, BackendError> {
        self.tokens
            .write()
            .map_err(|_| BackendError::Storage("lock poisoned".to_string()))
    }

    fn read_blobs(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, BlobSet>>, BackendError> {
        self.blobs
            .read()
            .map_err(|_| BackendError::Storage("lock poisoned".to_string()))
    }

    fn write_blobs(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, BlobSet>>, BackendError> {
        self.blobs
            .write()
            .map_err(|_| BackendError::Storage("lock poisoned".to_string()))
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for InMemoryBackend {
    fn load(&self, id: &JobId) -> Result<Token, BackendError> {
        self.read_tokens()?
            .get(id)
            .map(|stored| stored.token.clone())
            .ok_or_else(|| BackendError::NotFound(id.clone()))
    }

    fn save(&self, id: &JobId, token: &Token) -> Result<(), BackendError> {
        self.write_tokens()?.insert(
            id.clone(),
            StoredToken {
                token: token.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn delete(&self, id: &JobId) -> Result<(), BackendError> {
        self.write_tokens()?.remove(id);
        self.write_blobs()?.remove(id);
        Ok(())
    }

    fn store_blob(&self, id: &JobId, key: &str, bytes: &[u8]) -> Result<(), BackendError> {
        let mut blobs = self.write_blobs()?;
        let set = blobs.entry(id.clone()).or_default();
        set.blobs.insert(key.to_string(), bytes.to_vec());
        set.updated_at = Some(Utc::now());
        Ok(())
    }

    fn fetch_blob(&self, id: &JobId, key: &str) -> Result<Vec<u8>, BackendError> {
        self.read_blobs()?
            .get(id)
            .and_then(|set| set.blobs.get(key))
            .cloned()
            .ok_or_else(|| BackendError::BlobNotFound {
                id: id.clone(),
                key: key.to_string(),
            })
    }

    fn list(&self) -> Result<Vec<Result<JobEntry, CleanupFailure>>, BackendError> {
        let tokens = self.read_tokens()?;
        let blobs = self.read_blobs()?;

        let mut latest: HashMap<&JobId, DateTime<Utc>> = tokens
            .iter()
            .map(|(id, stored)| (id, stored.updated_at))
            .collect();

        // A job may own blobs without a token record (fresh job whose first
        // save never happened); it is still reclaimable.
        for (id, set) in blobs.iter() {
            if let Some(at) = set.updated_at {
                let slot = latest.entry(id).or_insert(at);
                if at > *slot {
                    *slot = at;
                }
            }
        }

        let mut entries: Vec<JobEntry> = latest
            .into_iter()
            .map(|(id, updated_at)| JobEntry {
                id: id.clone(),
                updated_at,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries.into_iter().map(Ok).collect())
    }

    fn auto_blob_threshold(&self) -> usize {
        self.auto_blob_threshold
    }

    fn cleanup_age(&self) -> Duration {
        self.cleanup_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn id(raw: &str) -> JobId {
        JobId::parse(raw).unwrap()
    }

    #[test]
    fn save_load_delete() {
        let backend = InMemoryBackend::new();
        let token = Token::with_id(id("j1")).with_iterations_per_call(3);

        assert!(matches!(
            backend.load(token.id()),
            Err(BackendError::NotFound(_))
        ));

        backend.save(token.id(), &token).unwrap();
        assert_eq!(backend.load(token.id()).unwrap(), token);

        backend.delete(token.id()).unwrap();
        backend.delete(token.id()).unwrap();
        assert!(backend.is_empty());
    }

    #[test]
    fn blobs_round_trip_and_go_with_the_job() {
        let backend = InMemoryBackend::new();
        let job = id("j1");

        backend.store_blob(&job, "payload", b"\x00\x01\x02").unwrap();
        assert_eq!(backend.fetch_blob(&job, "payload").unwrap(), b"\x00\x01\x02");
        assert!(matches!(
            backend.fetch_blob(&job, "other"),
            Err(BackendError::BlobNotFound { .. })
        ));

        backend.delete(&job).unwrap();
        assert_eq!(backend.blob_count(&job), 0);
    }

    #[test]
    fn cleanup_only_removes_records_older_than_threshold() {
        let backend = InMemoryBackend::new();
        let old = Token::with_id(id("old"));
        let recent = Token::with_id(id("recent"));
        backend.save(old.id(), &old).unwrap();
        backend.save(recent.id(), &recent).unwrap();
        backend.store_blob(old.id(), "big", b"bytes").unwrap();

        let now = Utc::now();
        backend.set_updated_at(old.id(), now - TimeDelta::days(5));
        backend.set_updated_at(recent.id(), now - TimeDelta::days(1));

        let report = backend.cleanup(Duration::from_secs(3 * 24 * 3600)).unwrap();
        assert_eq!(report.removed, vec![old.id().clone()]);
        assert!(!report.has_failures());
        assert!(!backend.contains(old.id()));
        assert_eq!(backend.blob_count(old.id()), 0);
        assert!(backend.contains(recent.id()));

        let again = backend.cleanup(Duration::from_secs(3 * 24 * 3600)).unwrap();
        assert_eq!(again.count(), 0);
    }

    #[test]
    fn cleanup_boundary_is_strict() {
        let backend = InMemoryBackend::new();
        let token = Token::with_id(id("edge"));
        backend.save(token.id(), &token).unwrap();

        let at = Utc::now() - TimeDelta::hours(1);
        backend.set_updated_at(token.id(), at);

        assert_eq!(backend.cleanup_before(at).unwrap().count(), 0);
        assert_eq!(
            backend
                .cleanup_before(at + TimeDelta::milliseconds(1))
                .unwrap()
                .count(),
            1
        );
    }

    #[test]
    fn orphaned_blobs_are_swept() {
        let backend = InMemoryBackend::new();
        let job = id("orphan");
        backend.store_blob(&job, "k", b"v").unwrap();
        backend.set_updated_at(&job, Utc::now() - TimeDelta::days(10));

        let report = backend.cleanup(Duration::from_secs(24 * 3600)).unwrap();
        assert_eq!(report.removed, vec![job.clone()]);
        assert_eq!(backend.blob_count(&job), 0);
    }
}
