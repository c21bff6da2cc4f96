//! Handler-facing view of the job being executed.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use stepwise_core::{BlobEncoding, BlobPolicy, BlobRef, JobId, Placement, Progress, Token};

use super::error::StageError;
use crate::backend::Backend;

/// Everything a start, stage or end handler may touch.
///
/// Control mutators change the token directly; data accessors route values
/// between the token and the backend's blob storage according to the
/// backend's auto-blob threshold, so handlers never need to know where a
/// value lives.
pub struct StageContext<'c> {
    token: &'c mut Token,
    backend: &'c dyn Backend,
    policy: BlobPolicy,
    stages: &'c [String],
}

impl<'c> StageContext<'c> {
    pub(crate) fn new(
        token: &'c mut Token,
        backend: &'c dyn Backend,
        policy: BlobPolicy,
        stages: &'c [String],
    ) -> Self {
        Self {
            token,
            backend,
            policy,
            stages,
        }
    }

    pub fn token(&self) -> &Token {
        self.token
    }

    pub fn id(&self) -> &JobId {
        self.token.id()
    }

    pub fn stage_name(&self) -> &str {
        self.token.stage_name()
    }

    pub fn iteration_count(&self) -> u64 {
        self.token.iteration_count()
    }

    pub fn iterations_per_call(&self) -> u32 {
        self.token.iterations_per_call()
    }

    pub fn progress(&self) -> Progress {
        self.token.progress()
    }

    // -- control ------------------------------------------------------------

    /// Switch the job to `name`. Takes effect on the next call; the current
    /// call stops iterating once the running handler returns.
    pub fn select_stage(&mut self, name: &str) -> Result<(), StageError> {
        if !self.stages.iter().any(|s| s == name) {
            return Err(StageError::UnknownStage(name.to_string()));
        }
        self.token.select_stage(name);
        Ok(())
    }

    /// No work remains. Idempotent.
    pub fn mark_done(&mut self) {
        self.token.mark_done();
    }

    /// Terminate the job with `message`. No-op once the job is terminal.
    pub fn abort(&mut self, message: impl Into<String>) {
        self.token.abort(message);
    }

    // -- data ---------------------------------------------------------------

    pub fn contains(&self, key: &str) -> bool {
        self.token.contains_key(key)
    }

    /// Fetch `key`, following blob references transparently.
    pub fn get(&self, key: &str) -> Result<Option<Value>, StageError> {
        if !self.token.is_blob(key) {
            return Ok(self.token.get_inline(key).cloned());
        }

        let marker = self
            .token
            .blob_ref(key)
            .ok_or_else(|| StageError::CorruptBlobRef(key.to_string()))?;
        let bytes = self.backend.fetch_blob(self.token.id(), key)?;

        let value = match marker.encoding {
            BlobEncoding::Json => serde_json::from_slice(&bytes)?,
            BlobEncoding::Raw => String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|_| StageError::NotUtf8(key.to_string()))?,
        };
        Ok(Some(value))
    }

    /// Fetch `key` and deserialize it into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StageError> {
        match self.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Store `value` under `key`, inline or as a blob depending on its size.
    pub fn set(&mut self, key: &str, value: impl Serialize) -> Result<(), StageError> {
        let value = serde_json::to_value(value)?;

        match self.policy.place(&value) {
            Placement::Inline => self.token.put_inline(key, value),
            Placement::Blob(bytes) => {
                debug!(job_id = %self.token.id(), key, len = bytes.len(), "storing value out-of-line");
                self.backend.store_blob(self.token.id(), key, &bytes)?;
                self.token.put_blob_ref(key, BlobRef::json(bytes.len()));
            }
        }
        Ok(())
    }

    /// Drop `key`. Returns whether it was present.
    ///
    /// Blob bytes stay in the backend until the job is deleted.
    pub fn remove(&mut self, key: &str) -> bool {
        self.token.remove(key).is_some()
    }

    /// Store raw bytes out-of-line, regardless of size.
    pub fn store_blob(&mut self, key: &str, bytes: &[u8]) -> Result<(), StageError> {
        self.backend.store_blob(self.token.id(), key, bytes)?;
        self.token.put_blob_ref(key, BlobRef::raw(bytes.len()));
        Ok(())
    }

    /// Fetch the raw bytes of a blob-stored key.
    pub fn fetch_blob(&self, key: &str) -> Result<Vec<u8>, StageError> {
        Ok(self.backend.fetch_blob(self.token.id(), key)?)
    }
}
