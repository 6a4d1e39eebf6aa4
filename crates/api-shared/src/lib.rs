//! # API Shared
//!
//! Shared wire definitions for the KIA APIs.
//!
//! Contains:
//! - Request and response DTOs (`dto` module), with conversions from the core types
//! - The `{success, data, meta, error}` response envelope and paging query
//! - Shared services like `HealthService`
//!
//! Used by `api-rest` and the CLI for common functionality.

pub mod dto;
pub mod envelope;
pub mod health;

pub use envelope::{ApiResponse, PageMeta, PageQuery};
pub use health::{HealthRes, HealthService};
