//! `jobward-core`: shared building blocks for the job system.
//!
//! This crate holds the pieces every other crate agrees on: strongly-typed
//! identifiers and the typed error contract handlers use to report failures.

pub mod error;
pub mod id;

pub use error::{ErrorKind, JobError};
pub use id::{EntryId, IdParseError, JobId};
