//! One call of a job: hydrate, dispatch, iterate, persist.

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use stepwise_core::{BlobPolicy, Token};

use super::context::StageContext;
use super::error::EngineError;
use super::registry::{CallExit, CallScope, Handler, StageRegistry};
use crate::backend::Backend;

/// Result of a successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutput {
    /// The token to hand back to the client.
    pub token: Token,
    /// Value returned by the last handler that ran. Not persisted.
    pub value: Option<Value>,
}

/// How a handler (or a whole stage loop) left the job.
#[derive(Debug)]
enum Outcome {
    Continue,
    Done,
    Abort(String),
    Failure(anyhow::Error),
}

/// Releases the call scope when the call ends, however it ends.
struct ScopeGuard<'h> {
    scope: Option<Box<dyn CallScope + 'h>>,
    exit: CallExit,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.as_mut() {
            scope.release(self.exit);
        }
    }
}

/// Executes stage registries against tokens persisted in a [`Backend`].
///
/// The engine holds no per-job state: everything a job needs between calls
/// lives in its token and the backend, so one engine can serve any number
/// of jobs from any number of threads.
pub struct JobEngine<B: Backend> {
    backend: B,
    policy: BlobPolicy,
}

impl<B: Backend> JobEngine<B> {
    /// Create an engine over `backend`, routing large values according to
    /// the backend's auto-blob threshold.
    pub fn new(backend: B) -> Self {
        let policy = BlobPolicy::new(backend.auto_blob_threshold());
        Self { backend, policy }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn policy(&self) -> BlobPolicy {
        self.policy
    }

    /// Run one call of the job described by `token`.
    ///
    /// Terminal tokens come back unchanged. Otherwise the current stage runs
    /// up to `iterations_per_call` times (unbounded when 0), the token is
    /// saved (or deleted once the job completes) and returned.
    ///
    /// An abort, explicit or caused by a failing handler, is reported as an
    /// error that still carries the persisted token.
    #[instrument(skip_all, fields(job_id = %token.id()))]
    pub fn run(&self, token: Token, registry: StageRegistry<'_>) -> Result<CallOutput, EngineError> {
        if token.is_terminal() {
            debug!(status = ?token.status(), "token is terminal, nothing to run");
            return Ok(CallOutput { token, value: None });
        }

        registry.validate()?;

        let mut token = self.hydrate(token)?;
        if token.is_terminal() {
            debug!(status = ?token.status(), "stored job is terminal, nothing to run");
            return Ok(CallOutput { token, value: None });
        }

        let StageRegistry {
            names,
            mut handlers,
            mut start,
            mut end,
            scope,
            ..
        } = registry;

        let mut guard = ScopeGuard {
            scope: None,
            exit: CallExit::Failed,
        };
        if let Some(mut scope) = scope {
            if let Err(error) = scope.acquire(&token) {
                return Err(self.fail(token, error.context("failed to acquire call scope")));
            }
            guard.scope = Some(scope);
        }

        let (outcome, value) = self.drive(
            &mut token,
            &names,
            &mut handlers,
            start.as_mut(),
            end.as_mut(),
        )?;

        match outcome {
            Outcome::Continue => {
                self.backend.save(token.id(), &token)?;
                guard.exit = CallExit::Parked;
                debug!(
                    stage = token.stage_name(),
                    iterations = token.iteration_count(),
                    "job parked"
                );
                Ok(CallOutput { token, value })
            }
            Outcome::Done => {
                self.backend.delete(token.id())?;
                guard.exit = CallExit::Completed;
                info!(iterations = token.iteration_count(), "job completed");
                Ok(CallOutput { token, value })
            }
            Outcome::Abort(message) => {
                self.backend.save(token.id(), &token)?;
                guard.exit = CallExit::Aborted;
                info!(stage = token.stage_name(), reason = %message, "job aborted");
                Err(EngineError::Aborted {
                    token: Box::new(token),
                    message,
                })
            }
            Outcome::Failure(error) => Err(self.fail(token, error)),
        }
    }

    /// Pick the working copy for this call.
    fn hydrate(&self, submitted: Token) -> Result<Token, EngineError> {
        if submitted.is_fresh() {
            info!("starting new job");
            return Ok(submitted);
        }

        let mut token = self.backend.load(submitted.id())?;
        token.set_iterations_per_call(submitted.iterations_per_call());
        Ok(token)
    }

    fn drive(
        &self,
        token: &mut Token,
        names: &[String],
        handlers: &mut [Handler<'_>],
        start: Option<&mut Handler<'_>>,
        end: Option<&mut Handler<'_>>,
    ) -> Result<(Outcome, Option<Value>), EngineError> {
        let mut last = None;

        if token.is_fresh() {
            if let Some(start) = start {
                debug!("running start handler");
                match self.invoke(start, token, names, &mut last) {
                    Outcome::Continue => {}
                    Outcome::Done => return Ok((self.finish(token, names, end, &mut last), last)),
                    other => return Ok((other, last)),
                }
            }
            if token.stage_name().is_empty() {
                if let Some(first) = names.first() {
                    token.select_stage(first.as_str());
                }
            }
        }

        let stage = token.stage_name().to_string();
        let handler = match names.iter().position(|name| *name == stage) {
            Some(index) => handlers.get_mut(index),
            None => None,
        };
        let Some(handler) = handler else {
            return Err(EngineError::UnknownStage { stage });
        };

        let budget = u64::from(token.iterations_per_call());
        let mut runs = 0u64;
        let outcome = loop {
            debug!(stage = %stage, iteration = token.iteration_count(), "running stage");
            let outcome = self.invoke(handler, token, names, &mut last);
            if !matches!(outcome, Outcome::Failure(_)) {
                token.record_iteration();
            }
            runs += 1;

            let exhausted = budget != 0 && runs >= budget;
            if !matches!(outcome, Outcome::Continue) || exhausted || token.stage_name() != stage {
                break outcome;
            }
        };

        let outcome = match outcome {
            Outcome::Done => self.finish(token, names, end, &mut last),
            other => other,
        };
        Ok((outcome, last))
    }

    /// Run the end handler of a job that just completed.
    fn finish(
        &self,
        token: &mut Token,
        names: &[String],
        end: Option<&mut Handler<'_>>,
        last: &mut Option<Value>,
    ) -> Outcome {
        let Some(end) = end else {
            return Outcome::Done;
        };

        debug!("running end handler");
        match self.invoke(end, token, names, last) {
            Outcome::Failure(error) => Outcome::Failure(error),
            _ => Outcome::Done,
        }
    }

    fn invoke(
        &self,
        handler: &mut Handler<'_>,
        token: &mut Token,
        names: &[String],
        last: &mut Option<Value>,
    ) -> Outcome {
        let result = {
            let mut ctx = StageContext::new(token, &self.backend, self.policy, names);
            handler(&mut ctx)
        };

        match result {
            Err(error) => Outcome::Failure(error),
            Ok(value) => {
                *last = Some(value);
                if token.is_aborted() {
                    Outcome::Abort(token.error().unwrap_or_default().to_string())
                } else if token.is_done() {
                    Outcome::Done
                } else {
                    Outcome::Continue
                }
            }
        }
    }

    /// Abort the token for `error`, persist it best-effort and build the
    /// error returned to the caller.
    fn fail(&self, mut token: Token, error: anyhow::Error) -> EngineError {
        let message = format!("{error:#}");
        if token.is_done() {
            token.fail_completion(message.as_str());
        } else {
            token.abort(message.as_str());
        }

        warn!(stage = token.stage_name(), error = %message, "handler failed, job aborted");
        if let Err(e) = self.backend.save(token.id(), &token) {
            warn!(error = %e, "failed to persist aborted job");
        }

        EngineError::Handler {
            token: Box::new(token),
            error,
        }
    }
}
