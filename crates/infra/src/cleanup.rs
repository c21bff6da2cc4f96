//! Cleanup sweep entry point.
//!
//! Reclaims jobs abandoned by clients that stopped calling back. Not part of
//! normal job execution; run it from a maintenance task.

use std::time::Duration;

use tracing::{info, warn};

use crate::backend::{Backend, BackendError, CleanupReport};

/// Sweep `backend`, removing jobs untouched for longer than `age_override`
/// (or the backend's configured cleanup age).
///
/// Safe to run repeatedly: already-removed jobs are simply not listed again.
pub fn run<B>(backend: &B, age_override: Option<Duration>) -> Result<CleanupReport, BackendError>
where
    B: Backend + ?Sized,
{
    let age = age_override.unwrap_or_else(|| backend.cleanup_age());
    let report = backend.cleanup(age)?;

    if report.has_failures() {
        warn!(
            age_secs = age.as_secs(),
            removed = report.count(),
            failed = report.failed.len(),
            "cleanup sweep finished with failures"
        );
    } else {
        info!(age_secs = age.as_secs(), removed = report.count(), "cleanup sweep finished");
    }

    Ok(report)
}
