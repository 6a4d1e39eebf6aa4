//! Record identifiers and sharded-path utilities.
//!
//! Every KIA entity (pregnancy, visit, delivery, immunization record, resident) is identified by a
//! UUID in *canonical* form: **32 lowercase hexadecimal characters** without hyphens, e.g.
//! `550e8400e29b41d4a716446655440000`. This is the value `Uuid::new_v4().simple()` prints.
//!
//! Canonical form is required for identifiers supplied from outside the engine (CLI arguments,
//! REST path segments). Use [`ShardableUuid::parse`] to validate them; uppercase, hyphenated or
//! wrong-length input is rejected, not normalised.
//!
//! ## Sharded layout
//! The YAML journal stores one file per record at
//! `parent_dir/<u[0..2]>/<u[2..4]>/<u>.yaml`, which keeps directory fan-out bounded even for a
//! district's worth of residents.

mod service;

pub use service::{ShardableUuid, Uuid};

/// Error type for identifier operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UuidError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for identifier operations.
pub type UuidResult<T> = Result<T, UuidError>;
