//! Directory-per-job token store.
//!
//! Layout under the configured base directory:
//!
//! ```text
//! <base_dir>/<job id>/state.json        {"updated_at": ..., "token": {...}}
//! <base_dir>/<job id>/blobs/<sha256(key)> raw blob bytes
//! ```
//!
//! Every write goes to a `.tmp` sibling first and is renamed into place, so a
//! reader never observes a half-written record. Blob files are named by the
//! hex SHA-256 of their key, so any field name maps to a fixed-length,
//! path-safe file name.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use stepwise_core::{JobId, Token};

use super::{Backend, BackendError, CleanupFailure, JobEntry};
use crate::config::BackendConfig;

const STATE_FILE: &str = "state.json";
const BLOB_DIR: &str = "blobs";

#[derive(Debug, Serialize, Deserialize)]
struct StoredState {
    updated_at: DateTime<Utc>,
    token: Token,
}

/// Filesystem-backed token store.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    base_dir: PathBuf,
    auto_blob_threshold: usize,
    cleanup_age: Duration,
}

impl FilesystemBackend {
    /// Open (and create, if needed) the store rooted at `config.base_dir`.
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        fs::create_dir_all(&config.base_dir).map_err(|e| {
            BackendError::storage(format!("create {}", config.base_dir.display()), e)
        })?;

        Ok(Self {
            base_dir: config.base_dir.clone(),
            auto_blob_threshold: config.auto_blob_threshold,
            cleanup_age: config.cleanup_age,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn job_dir(&self, id: &JobId) -> PathBuf {
        self.base_dir.join(id.as_str())
    }

    fn state_path(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join(STATE_FILE)
    }

    fn blob_path(&self, id: &JobId, key: &str) -> PathBuf {
        self.job_dir(id).join(BLOB_DIR).join(blob_file_name(key))
    }

    fn save_at(&self, id: &JobId, token: &Token, updated_at: DateTime<Utc>) -> Result<(), BackendError> {
        let bytes = serde_json::to_vec(&StoredState {
            updated_at,
            token: token.clone(),
        })
        .map_err(|e| BackendError::Codec(e.to_string()))?;

        write_atomic(&self.state_path(id), &bytes)
    }

    /// Last-modified time of one job directory.
    fn inspect(&self, dir: &Path) -> Result<DateTime<Utc>, String> {
        let state_path = dir.join(STATE_FILE);
        match fs::read(&state_path) {
            Ok(bytes) => match serde_json::from_slice::<StoredState>(&bytes) {
                Ok(state) => Ok(state.updated_at),
                // Unreadable record: fall back to the file's mtime so it can
                // still be reclaimed.
                Err(_) => modified_at(&state_path),
            },
            // Blobs written before the first save.
            Err(e) if e.kind() == ErrorKind::NotFound => modified_at(dir),
            Err(e) => Err(format!("read {}: {e}", state_path.display())),
        }
    }
}

impl Backend for FilesystemBackend {
    fn load(&self, id: &JobId) -> Result<Token, BackendError> {
        let path = self.state_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BackendError::NotFound(id.clone()));
            }
            Err(e) => return Err(BackendError::storage(format!("read {}", path.display()), e)),
        };

        let state: StoredState =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::Codec(e.to_string()))?;
        Ok(state.token)
    }

    fn save(&self, id: &JobId, token: &Token) -> Result<(), BackendError> {
        self.save_at(id, token, Utc::now())
    }

    fn delete(&self, id: &JobId) -> Result<(), BackendError> {
        let dir = self.job_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackendError::storage(format!("remove {}", dir.display()), e)),
        }
    }

    fn store_blob(&self, id: &JobId, key: &str, bytes: &[u8]) -> Result<(), BackendError> {
        write_atomic(&self.blob_path(id, key), bytes)
    }

    fn fetch_blob(&self, id: &JobId, key: &str) -> Result<Vec<u8>, BackendError> {
        let path = self.blob_path(id, key);
        fs::read(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                BackendError::BlobNotFound {
                    id: id.clone(),
                    key: key.to_string(),
                }
            } else {
                BackendError::storage(format!("read {}", path.display()), e)
            }
        })
    }

    fn list(&self) -> Result<Vec<Result<JobEntry, CleanupFailure>>, BackendError> {
        let dir = fs::read_dir(&self.base_dir).map_err(|e| {
            BackendError::storage(format!("list {}", self.base_dir.display()), e)
        })?;

        let mut entries = Vec::new();
        for entry in dir {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    entries.push(Err(CleanupFailure {
                        job: self.base_dir.display().to_string(),
                        error: e.to_string(),
                    }));
                    continue;
                }
            };

            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(id) = JobId::parse(name.as_str()) else {
                debug!(name = %name, "ignoring foreign directory in state dir");
                continue;
            };

            entries.push(
                self.inspect(&entry.path())
                    .map(|updated_at| JobEntry { id, updated_at })
                    .map_err(|error| CleanupFailure { job: name, error }),
            );
        }

        Ok(entries)
    }

    fn auto_blob_threshold(&self) -> usize {
        self.auto_blob_threshold
    }

    fn cleanup_age(&self) -> Duration {
        self.cleanup_age
    }
}

fn blob_file_name(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BackendError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| BackendError::storage(format!("create {}", parent.display()), e))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)
        .map_err(|e| BackendError::storage(format!("write {}", tmp.display()), e))?;
    fs::rename(&tmp, path).map_err(|e| {
        BackendError::storage(format!("rename {} -> {}", tmp.display(), path.display()), e)
    })
}

fn modified_at(path: &Path) -> Result<DateTime<Utc>, String> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .map_err(|e| format!("stat {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use serde_json::json;

    fn backend(dir: &tempfile::TempDir) -> FilesystemBackend {
        FilesystemBackend::new(&BackendConfig::default().with_base_dir(dir.path())).unwrap()
    }

    fn token(raw: &str) -> Token {
        Token::with_id(JobId::parse(raw).unwrap()).with_data("files", json!(["a", "b"]))
    }

    #[test]
    fn save_then_load_returns_the_same_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir);
        let t = token("j1");

        store.save(t.id(), &t).unwrap();
        assert_eq!(store.load(t.id()).unwrap(), t);
        assert!(!dir.path().join("j1").join("state.json.tmp").exists());
    }

    #[test]
    fn missing_job_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir);
        let id = JobId::parse("nobody").unwrap();

        assert!(matches!(store.load(&id), Err(BackendError::NotFound(_))));
        store.delete(&id).unwrap();
    }

    #[test]
    fn blobs_live_under_the_job_and_are_deleted_with_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir);
        let t = token("j1");

        store.store_blob(t.id(), "weird/key name", b"payload").unwrap();
        store.save(t.id(), &t).unwrap();
        assert_eq!(store.fetch_blob(t.id(), "weird/key name").unwrap(), b"payload");
        assert!(matches!(
            store.fetch_blob(t.id(), "absent"),
            Err(BackendError::BlobNotFound { .. })
        ));

        store.delete(t.id()).unwrap();
        assert!(!dir.path().join("j1").exists());
    }

    #[test]
    fn blob_names_are_path_safe() {
        assert_eq!(
            blob_file_name(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(blob_file_name("a/").len(), 64);
        assert_ne!(blob_file_name("a/"), blob_file_name("a"));
    }

    #[test]
    fn long_keys_are_stored_like_short_ones() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir);
        let t = token("j1");
        let key = "k".repeat(300);

        store.store_blob(t.id(), &key, b"payload").unwrap();
        assert_eq!(store.fetch_blob(t.id(), &key).unwrap(), b"payload");

        let memory = crate::backend::InMemoryBackend::new();
        memory.store_blob(t.id(), &key, b"payload").unwrap();
        assert_eq!(memory.fetch_blob(t.id(), &key).unwrap(), b"payload");
    }

    #[test]
    fn cleanup_removes_only_stale_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir);
        let stale = token("stale");
        let fresh = token("fresh");

        store
            .save_at(stale.id(), &stale, Utc::now() - TimeDelta::days(4))
            .unwrap();
        store.store_blob(stale.id(), "big", b"x").unwrap();
        store.save(fresh.id(), &fresh).unwrap();
        fs::create_dir_all(dir.path().join(".not-a-job")).unwrap();

        let report = store.cleanup(Duration::from_secs(3 * 24 * 3600)).unwrap();
        assert_eq!(report.removed, vec![stale.id().clone()]);
        assert!(!report.has_failures());
        assert!(!dir.path().join("stale").exists());
        assert!(store.load(fresh.id()).is_ok());

        assert_eq!(store.cleanup(Duration::from_secs(3 * 24 * 3600)).unwrap().count(), 0);
    }

    #[test]
    fn corrupt_records_are_still_reclaimable() {
        let dir = tempfile::tempdir().unwrap();
        let store = backend(&dir);
        let job_dir = dir.path().join("broken");
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(job_dir.join(STATE_FILE), b"{ not json").unwrap();

        let id = JobId::parse("broken").unwrap();
        assert!(matches!(store.load(&id), Err(BackendError::Codec(_))));

        // Zero threshold: anything modified before "now" is stale.
        std::thread::sleep(Duration::from_millis(20));
        let report = store.cleanup(Duration::ZERO).unwrap();
        assert_eq!(report.removed, vec![id]);
    }
}
