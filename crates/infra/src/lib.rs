//! Infrastructure layer: persistence backends, configuration and the job
//! engine that drives stages against them.

pub mod backend;
pub mod cleanup;
pub mod config;
pub mod jobs;

pub use backend::{Backend, BackendError, CleanupReport, FilesystemBackend, InMemoryBackend};
pub use config::{BackendConfig, ConfigError};
pub use jobs::{CallOutput, EngineError, JobEngine, StageContext, StageRegistry};
