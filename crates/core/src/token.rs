//! The client-held job token.
//!
//! A token is the only thing that crosses the system boundary: it is handed
//! to the client after every call and submitted again on the next one. It
//! carries identity, control flags, progress counters and the job's named
//! data.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blob::BlobRef;
use crate::error::{DomainError, DomainResult};
use crate::id::JobId;

/// Lifecycle state of a job, as observed through its token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    /// No call has decided a stage yet.
    Fresh,
    /// Parked on a stage, more work remains.
    Running,
    /// Finished normally.
    Completed,
    /// Terminated abnormally.
    Aborted,
}

impl TokenStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TokenStatus::Completed | TokenStatus::Aborted)
    }
}

/// Client-facing summary of how far a job has got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub stage: String,
    pub status: TokenStatus,
    pub iteration_count: u64,
    pub iterations_per_call: u32,
}

/// Serializable job state.
///
/// Invariants (checked on deserialization, upheld by the mutators):
/// - `done` and `abort` are never both set
/// - `error` is present iff `abort` is set
/// - every key in `blob_keys` is also a key of `data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TokenRepr")]
pub struct Token {
    id: JobId,
    stage_name: String,
    done: bool,
    abort: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    iteration_count: u64,
    iterations_per_call: u32,
    data: BTreeMap<String, Value>,
    blob_keys: BTreeSet<String>,
}

/// Unvalidated wire shape of a [`Token`].
#[derive(Deserialize)]
struct TokenRepr {
    id: JobId,
    stage_name: String,
    done: bool,
    abort: bool,
    #[serde(default)]
    error: Option<String>,
    iteration_count: u64,
    iterations_per_call: u32,
    data: BTreeMap<String, Value>,
    blob_keys: BTreeSet<String>,
}

impl TryFrom<TokenRepr> for Token {
    type Error = DomainError;

    fn try_from(repr: TokenRepr) -> Result<Self, Self::Error> {
        let token = Token {
            id: repr.id,
            stage_name: repr.stage_name,
            done: repr.done,
            abort: repr.abort,
            error: repr.error,
            iteration_count: repr.iteration_count,
            iterations_per_call: repr.iterations_per_call,
            data: repr.data,
            blob_keys: repr.blob_keys,
        };
        token.validate()?;
        Ok(token)
    }
}

impl Token {
    /// A fresh token with a generated id.
    pub fn new() -> Self {
        Self::with_id(JobId::new())
    }

    /// A fresh token for a caller-chosen id.
    pub fn with_id(id: JobId) -> Self {
        Self {
            id,
            stage_name: String::new(),
            done: false,
            abort: false,
            error: None,
            iteration_count: 0,
            iterations_per_call: 0,
            data: BTreeMap::new(),
            blob_keys: BTreeSet::new(),
        }
    }

    /// Set the per-call iteration budget (0 = unbounded).
    pub fn with_iterations_per_call(mut self, n: u32) -> Self {
        self.iterations_per_call = n;
        self
    }

    /// Seed an inline data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.put_inline(key, value);
        self
    }

    /// Check the token invariants.
    pub fn validate(&self) -> DomainResult<()> {
        if self.done && self.abort {
            return Err(DomainError::invariant("token is both done and aborted"));
        }
        if self.abort != self.error.is_some() {
            return Err(DomainError::invariant(
                "error message must be present exactly when aborted",
            ));
        }
        if let Some(key) = self.blob_keys.iter().find(|k| !self.data.contains_key(*k)) {
            return Err(DomainError::invariant(format!(
                "blob key {key:?} has no data entry"
            )));
        }
        Ok(())
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn is_aborted(&self) -> bool {
        self.abort
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn iteration_count(&self) -> u64 {
        self.iteration_count
    }

    pub fn iterations_per_call(&self) -> u32 {
        self.iterations_per_call
    }

    pub fn set_iterations_per_call(&mut self, n: u32) {
        self.iterations_per_call = n;
    }

    pub fn status(&self) -> TokenStatus {
        if self.done {
            TokenStatus::Completed
        } else if self.abort {
            TokenStatus::Aborted
        } else if self.stage_name.is_empty() {
            TokenStatus::Fresh
        } else {
            TokenStatus::Running
        }
    }

    pub fn progress(&self) -> Progress {
        Progress {
            stage: self.stage_name.clone(),
            status: self.status(),
            iteration_count: self.iteration_count,
            iterations_per_call: self.iterations_per_call,
        }
    }

    /// No call has picked a stage yet.
    pub fn is_fresh(&self) -> bool {
        self.status() == TokenStatus::Fresh
    }

    /// Done or aborted; no stage may run against this token any more.
    pub fn is_terminal(&self) -> bool {
        self.done || self.abort
    }

    // -- control mutators ---------------------------------------------------

    /// Park the job on `name` for the next execution. No-op once terminal.
    pub fn select_stage(&mut self, name: impl Into<String>) {
        if !self.is_terminal() {
            self.stage_name = name.into();
        }
    }

    /// Mark the job finished. Returns whether this call changed anything.
    pub fn mark_done(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.done = true;
        true
    }

    /// Terminate the job with `message`. Returns whether this call changed
    /// anything; the first abort message wins.
    pub fn abort(&mut self, message: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.abort = true;
        self.error = Some(message.into());
        true
    }

    /// Turn a completed token into an aborted one.
    ///
    /// Used when work after the final stage (the end handler) fails: the job
    /// did not finish normally after all.
    pub fn fail_completion(&mut self, message: impl Into<String>) {
        if self.done {
            self.done = false;
            self.abort = true;
            self.error = Some(message.into());
        }
    }

    /// Count one executed stage body.
    pub fn record_iteration(&mut self) {
        self.iteration_count += 1;
    }

    // -- data ---------------------------------------------------------------

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    pub fn blob_keys(&self) -> &BTreeSet<String> {
        &self.blob_keys
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn is_blob(&self, key: &str) -> bool {
        self.blob_keys.contains(key)
    }

    /// Raw `data` entry; for blob keys this is the [`BlobRef`] marker.
    pub fn get_inline(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Marker of an out-of-line value, if `key` is stored as a blob.
    pub fn blob_ref(&self, key: &str) -> Option<BlobRef> {
        if !self.is_blob(key) {
            return None;
        }
        self.data.get(key).and_then(BlobRef::from_value)
    }

    /// Store `value` inline, replacing any previous (possibly blob) entry.
    pub fn put_inline(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.blob_keys.remove(&key);
        self.data.insert(key, value);
    }

    /// Record that `key` now lives out-of-line.
    pub fn put_blob_ref(&mut self, key: impl Into<String>, marker: BlobRef) {
        let key = key.into();
        self.data.insert(key.clone(), marker.to_value());
        self.blob_keys.insert(key);
    }

    /// Drop `key` from the token. Returns the raw entry that was removed.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.blob_keys.remove(key);
        self.data.remove(key)
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn token() -> Token {
        Token::with_id(JobId::parse("j1").unwrap())
    }

    #[test]
    fn fresh_token_lifecycle() {
        let mut t = token();
        assert_eq!(t.status(), TokenStatus::Fresh);

        t.select_stage("scan");
        assert_eq!(t.status(), TokenStatus::Running);

        assert_eq!(t.progress().stage, "scan");

        assert!(t.mark_done());
        assert!(!t.mark_done());
        assert_eq!(t.status(), TokenStatus::Completed);
        assert!(t.is_terminal());
    }

    #[test]
    fn abort_is_exclusive_with_done() {
        let mut t = token();
        assert!(t.abort("disk full"));
        assert!(!t.mark_done());
        assert!(!t.abort("second message"));
        assert_eq!(t.error(), Some("disk full"));
        assert!(!t.is_done());
        assert!(t.validate().is_ok());
    }

    #[test]
    fn terminal_token_ignores_stage_selection() {
        let mut t = token();
        t.select_stage("a");
        t.mark_done();
        t.select_stage("b");
        assert_eq!(t.stage_name(), "a");
    }

    #[test]
    fn fail_completion_flips_done_to_abort() {
        let mut t = token();
        t.mark_done();
        t.fail_completion("end handler failed");
        assert!(t.is_aborted());
        assert!(!t.is_done());
        assert!(t.validate().is_ok());
    }

    #[test]
    fn blob_refs_track_blob_keys() {
        let mut t = token();
        t.put_blob_ref("report", BlobRef::json(1024));
        assert!(t.is_blob("report"));
        assert_eq!(t.blob_ref("report"), Some(BlobRef::json(1024)));

        t.put_inline("report", json!("short"));
        assert!(!t.is_blob("report"));
        assert_eq!(t.get_inline("report"), Some(&json!("short")));

        t.put_blob_ref("raw", BlobRef::raw(3));
        t.remove("raw");
        assert!(t.blob_keys().is_empty());
        assert!(t.validate().is_ok());
    }

    #[test]
    fn wire_form_omits_error_unless_aborted() {
        let t = token().with_iterations_per_call(2).with_data("files", json!(["a"]));
        let wire = serde_json::to_value(&t).unwrap();
        assert_eq!(
            wire,
            json!({
                "id": "j1",
                "stage_name": "",
                "done": false,
                "abort": false,
                "iteration_count": 0,
                "iterations_per_call": 2,
                "data": { "files": ["a"] },
                "blob_keys": []
            })
        );

        let back: Token = serde_json::from_value(wire).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn deserialization_rejects_broken_invariants() {
        let both = json!({
            "id": "j1", "stage_name": "s", "done": true, "abort": true,
            "error": "x", "iteration_count": 0, "iterations_per_call": 0,
            "data": {}, "blob_keys": []
        });
        assert!(serde_json::from_value::<Token>(both).is_err());

        let dangling_blob = json!({
            "id": "j1", "stage_name": "s", "done": false, "abort": false,
            "iteration_count": 0, "iterations_per_call": 0,
            "data": {}, "blob_keys": ["missing"]
        });
        assert!(serde_json::from_value::<Token>(dangling_blob).is_err());

        let abort_without_error = json!({
            "id": "j1", "stage_name": "s", "done": false, "abort": true,
            "iteration_count": 0, "iterations_per_call": 0,
            "data": {}, "blob_keys": []
        });
        assert!(serde_json::from_value::<Token>(abort_without_error).is_err());
    }

    proptest! {
        /// Property: no sequence of mutator calls can break the token invariants.
        #[test]
        fn mutator_sequences_preserve_invariants(ops in prop::collection::vec(0u8..7, 0..40)) {
            let mut t = token();
            for (i, op) in ops.into_iter().enumerate() {
                let key = format!("k{}", i % 3);
                match op {
                    0 => t.select_stage(format!("s{i}")),
                    1 => { t.mark_done(); }
                    2 => { t.abort(format!("abort {i}")); }
                    3 => t.put_inline(key, json!(i)),
                    4 => t.put_blob_ref(key, BlobRef::json(i)),
                    5 => { t.remove(&key); }
                    _ => t.fail_completion("late failure"),
                }
                prop_assert!(t.validate().is_ok());
            }
        }
    }
}
