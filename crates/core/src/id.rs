//! Job identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Longest id accepted from outside the process.
pub const MAX_ID_LEN: usize = 128;

/// Identifier of a job (and of its token).
///
/// Ids are opaque strings so that clients can keep whatever their transport
/// hands back, but they are restricted to a conservative character set:
/// every backend uses the id verbatim as a storage key or path component.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Validate and wrap an externally supplied id.
    pub fn parse(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        validate(&raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(raw: &str) -> Result<(), DomainError> {
    if raw.is_empty() {
        return Err(DomainError::invalid_id("JobId: empty"));
    }
    if raw.len() > MAX_ID_LEN {
        return Err(DomainError::invalid_id(format!(
            "JobId: longer than {MAX_ID_LEN} bytes"
        )));
    }
    if raw.starts_with('.') {
        return Err(DomainError::invalid_id("JobId: leading '.'"));
    }
    if let Some(c) = raw
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(DomainError::invalid_id(format!(
            "JobId: unexpected character {c:?}"
        )));
    }
    Ok(())
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid_and_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert!(JobId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn accepts_plain_ids() {
        for raw in ["j1", "job_2024-01.part", "A"] {
            assert_eq!(JobId::parse(raw).unwrap().as_str(), raw);
        }
    }

    #[test]
    fn rejects_path_like_ids() {
        for raw in ["", "..", ".hidden", "a/b", "a\\b", "with space", "ümlaut"] {
            assert!(
                matches!(JobId::parse(raw), Err(DomainError::InvalidId(_))),
                "{raw:?} should be rejected"
            );
        }
        assert!(JobId::parse("x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn deserialization_validates() {
        let ok: JobId = serde_json::from_str("\"j1\"").unwrap();
        assert_eq!(ok.as_str(), "j1");
        assert!(serde_json::from_str::<JobId>("\"../etc\"").is_err());
    }
}
