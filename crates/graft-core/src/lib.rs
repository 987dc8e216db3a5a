//! Graft core: domain types and errors.
//!
//! This crate defines the foundational types for the graft dependency
//! and change-propagation engine. It contains no I/O, only type
//! definitions, constructor-level validation, and the error taxonomy.

pub mod domain;
pub mod error;

pub use domain::{
    utc_timestamp_now, Change, ChangeType, Command, CommitHash, DependencySpec, GitRef, GitUrl,
    GraftConfig, LockEntry, LockFile, Metadata,
};
pub use error::{GraftError, MigrationPhase, Result};
