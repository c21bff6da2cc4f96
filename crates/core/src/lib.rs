//! `stepwise-core`: the token model.
//!
//! This crate contains **pure** primitives (no storage, no dispatch): job
//! identifiers, the client-held [`Token`] with its control mutators, and the
//! [`BlobPolicy`] that decides inline vs. out-of-line placement of values.

pub mod blob;
pub mod error;
pub mod id;
pub mod token;

pub use blob::{BlobEncoding, BlobPolicy, BlobRef, Placement};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use token::{Progress, Token, TokenStatus};
