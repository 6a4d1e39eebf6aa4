//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into the engine as an
//! `Arc<CoreConfig>`. Request handling never reads process-wide environment variables, which keeps
//! behaviour consistent across threads and test harnesses.

use crate::constants::{
    DEFAULT_IDL_COMPLETION_AGE_MONTHS, DEFAULT_PER_PAGE, DEFAULT_TARGET_MAX_AGE_MONTHS,
    MAX_PER_PAGE,
};
use crate::{KiaError, KiaResult};
use std::path::{Path, PathBuf};

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    data_dir: Option<PathBuf>,
    idl_completion_age_months: u32,
    target_max_age_months: u32,
    default_per_page: u32,
    max_per_page: u32,
}

impl Default for CoreConfig {
    /// Memory-only configuration with the standard posyandu thresholds.
    fn default() -> Self {
        Self {
            data_dir: None,
            idl_completion_age_months: DEFAULT_IDL_COMPLETION_AGE_MONTHS,
            target_max_age_months: DEFAULT_TARGET_MAX_AGE_MONTHS,
            default_per_page: DEFAULT_PER_PAGE,
            max_per_page: MAX_PER_PAGE,
        }
    }
}

impl CoreConfig {
    /// Create a new `CoreConfig` with default paging.
    ///
    /// # Errors
    ///
    /// Returns `KiaError::InvalidConfig` if the completion age exceeds the target window, since no
    /// child inside the target population could then ever count as complete.
    pub fn new(
        data_dir: Option<PathBuf>,
        idl_completion_age_months: u32,
        target_max_age_months: u32,
    ) -> KiaResult<Self> {
        if idl_completion_age_months > target_max_age_months {
            return Err(KiaError::InvalidConfig(format!(
                "IDL completion age ({} months) exceeds target population window ({} months)",
                idl_completion_age_months, target_max_age_months
            )));
        }

        Ok(Self {
            data_dir,
            idl_completion_age_months,
            target_max_age_months,
            ..Self::default()
        })
    }

    /// Override the paging bounds.
    pub fn with_paging(mut self, default_per_page: u32, max_per_page: u32) -> KiaResult<Self> {
        if default_per_page == 0 || default_per_page > max_per_page {
            return Err(KiaError::InvalidConfig(format!(
                "per-page bounds must satisfy 0 < default ({}) <= max ({})",
                default_per_page, max_per_page
            )));
        }
        self.default_per_page = default_per_page;
        self.max_per_page = max_per_page;
        Ok(self)
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn idl_completion_age_months(&self) -> u32 {
        self.idl_completion_age_months
    }

    pub fn target_max_age_months(&self) -> u32 {
        self.target_max_age_months
    }

    pub fn default_per_page(&self) -> u32 {
        self.default_per_page
    }

    pub fn max_per_page(&self) -> u32 {
        self.max_per_page
    }
}

/// Parse an age threshold (in months) from an optional environment value.
///
/// `None` or a blank value yields `default`.
pub fn months_from_env_value(name: &str, value: Option<String>, default: u32) -> KiaResult<u32> {
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    match value {
        None => Ok(default),
        Some(v) => v.parse::<u32>().map_err(|_| {
            KiaError::InvalidConfig(format!("{} must be a whole number of months, got '{}'", name, v))
        }),
    }
}

/// Resolve the journal directory, creating it if needed.
///
/// Returns `None` when no directory is configured (memory-only operation).
pub fn resolve_data_dir(value: Option<String>) -> KiaResult<Option<PathBuf>> {
    let Some(raw) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };

    let dir = PathBuf::from(raw);
    if dir.exists() && !dir.is_dir() {
        return Err(KiaError::InvalidConfig(format!(
            "data directory is not a directory: {}",
            dir.display()
        )));
    }
    std::fs::create_dir_all(&dir).map_err(KiaError::DirCreation)?;
    Ok(Some(dir))
}
