//! Per-call stage declarations.

use serde_json::Value;

use stepwise_core::Token;

use super::context::StageContext;
use super::error::RegistryError;

/// What a handler returns: a value for the caller of this call, or a
/// failure that aborts the job.
pub type HandlerResult = anyhow::Result<Value>;

/// A start, stage or end handler.
pub type Handler<'h> = Box<dyn FnMut(&mut StageContext<'_>) -> HandlerResult + 'h>;

/// How a call ended, as reported to [`CallScope::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallExit {
    /// More work remains; the token was saved.
    Parked,
    /// The job finished and its record was removed.
    Completed,
    /// A handler aborted the job.
    Aborted,
    /// A handler, the scope itself or the backend failed.
    Failed,
}

/// A resource held for the duration of one engine call.
///
/// `acquire` runs before any handler; `release` runs after the token has
/// been persisted, whatever the outcome, including a panic unwinding out of
/// a handler. `release` is only called if `acquire` succeeded.
pub trait CallScope {
    fn acquire(&mut self, token: &Token) -> anyhow::Result<()>;

    fn release(&mut self, exit: CallExit);
}

/// Ordered set of named stages declared for one call.
///
/// Built fresh on every call; the first declared stage is where a fresh job
/// starts unless the start handler selects another one.
///
/// ```ignore
/// let registry = StageRegistry::new()
///     .on_start(|ctx| { ctx.set("files", list_files()?)?; Ok(Value::Null) })
///     .stage("copy", |ctx| copy_one(ctx))
///     .stage("verify", |ctx| verify_one(ctx))
///     .on_end(|ctx| Ok(json!({ "copied": ctx.iteration_count() })));
/// ```
#[derive(Default)]
pub struct StageRegistry<'h> {
    pub(crate) names: Vec<String>,
    pub(crate) handlers: Vec<Handler<'h>>,
    pub(crate) start: Option<Handler<'h>>,
    pub(crate) end: Option<Handler<'h>>,
    pub(crate) scope: Option<Box<dyn CallScope + 'h>>,
    pub(crate) duplicate: Option<String>,
}

impl<'h> StageRegistry<'h> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler run once, on the first call of a job.
    pub fn on_start<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut StageContext<'_>) -> HandlerResult + 'h,
    {
        self.start = Some(Box::new(handler));
        self
    }

    /// Append a named stage.
    pub fn stage<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(&mut StageContext<'_>) -> HandlerResult + 'h,
    {
        let name = name.into();
        if self.names.contains(&name) {
            self.duplicate.get_or_insert(name);
        } else {
            self.names.push(name);
            self.handlers.push(Box::new(handler));
        }
        self
    }

    /// Handler run once, after the call in which the job completes.
    pub fn on_end<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&mut StageContext<'_>) -> HandlerResult + 'h,
    {
        self.end = Some(Box::new(handler));
        self
    }

    /// Hold `scope` around the whole call.
    pub fn scoped(mut self, scope: impl CallScope + 'h) -> Self {
        self.scope = Some(Box::new(scope));
        self
    }

    pub fn stage_names(&self) -> &[String] {
        &self.names
    }

    pub fn first_stage(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if let Some(name) = &self.duplicate {
            return Err(RegistryError::DuplicateStage(name.clone()));
        }
        if self.names.is_empty() {
            return Err(RegistryError::NoStages);
        }
        Ok(())
    }
}

impl core::fmt::Debug for StageRegistry<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stages", &self.names)
            .field("start", &self.start.is_some())
            .field("end", &self.end.is_some())
            .field("scoped", &self.scope.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut StageContext<'_>) -> HandlerResult {
        Ok(Value::Null)
    }

    #[test]
    fn keeps_declaration_order() {
        let registry = StageRegistry::new()
            .stage("scan", noop)
            .stage("copy", noop)
            .stage("verify", noop);

        assert_eq!(registry.stage_names(), ["scan", "copy", "verify"]);
        assert_eq!(registry.first_stage(), Some("scan"));
        assert!(registry.contains("copy"));
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn empty_registry_is_rejected() {
        let registry = StageRegistry::new().on_start(noop);
        assert_eq!(registry.validate(), Err(RegistryError::NoStages));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = StageRegistry::new()
            .stage("scan", noop)
            .stage("scan", noop);
        assert_eq!(
            registry.validate(),
            Err(RegistryError::DuplicateStage("scan".to_string()))
        );
    }
}
