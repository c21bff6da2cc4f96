//! Token/stage execution engine.
//!
//! ## Design
//!
//! - Every call is stateless: the job's progress lives in its [`Token`] and
//!   the [`Backend`]
//! - Stages are declared per call, in order; the first one is the default
//! - A call runs one stage up to `iterations_per_call` times
//! - Abort and handler failure are explicit outcomes, persisted and returned
//!
//! ## Components
//!
//! - `StageRegistry`: ordered stage handlers plus optional start/end/scope
//! - `StageContext`: what handlers see (control mutators, blob-aware data)
//! - `JobEngine`: hydrates, dispatches, persists
//!
//! [`Token`]: stepwise_core::Token
//! [`Backend`]: crate::backend::Backend

pub mod context;
pub mod engine;
pub mod error;
pub mod registry;

pub use context::StageContext;
pub use engine::{CallOutput, JobEngine};
pub use error::{EngineError, RegistryError, StageError};
pub use registry::{CallExit, CallScope, Handler, HandlerResult, StageRegistry};
