//! Engine and handler-facing error types.

use thiserror::Error;

use stepwise_core::Token;

use crate::backend::BackendError;

/// Stage registry misconfiguration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no stages registered")]
    NoStages,
    #[error("stage {0:?} registered more than once")]
    DuplicateStage(String),
}

/// Errors raised by [`StageContext`](super::StageContext) operations.
///
/// Handlers usually bubble these up with `?`; the engine then aborts the job
/// with the error's message.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("unknown stage {0:?}")]
    UnknownStage(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("blob {0:?} is not valid UTF-8")]
    NotUtf8(String),

    #[error("blob marker for {0:?} is malformed")]
    CorruptBlobRef(String),
}

/// Failure of one engine call.
///
/// `Aborted` and `Handler` carry the token as it was persisted, so callers
/// can hand it back to the client as well as react to the error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("token is parked on stage {stage:?}, which is not registered")]
    UnknownStage { stage: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("job aborted: {message}")]
    Aborted { token: Box<Token>, message: String },

    #[error("handler failed: {error:#}")]
    Handler { token: Box<Token>, error: anyhow::Error },
}

impl EngineError {
    /// The job's token, when the failure left one behind.
    pub fn token(&self) -> Option<&Token> {
        match self {
            Self::Aborted { token, .. } | Self::Handler { token, .. } => Some(token.as_ref()),
            _ => None,
        }
    }

    pub fn into_token(self) -> Option<Token> {
        match self {
            Self::Aborted { token, .. } | Self::Handler { token, .. } => Some(*token),
            _ => None,
        }
    }

    /// Whether the storage layer reported the job as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Backend(BackendError::NotFound(_)))
    }
}
