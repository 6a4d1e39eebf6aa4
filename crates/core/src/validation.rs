//! Input validation utilities.
//!
//! Small checks shared by the services. Each returns `KiaError::Validation` with a message that
//! names the offending field, so it can be shown to the kader as-is.

use crate::{KiaError, KiaResult};

/// Validates that a tenant identifier is safe to use as a journal directory name.
///
/// Rejects empty input, input longer than 253 characters, and anything outside
/// `[A-Za-z0-9._-]`. A bare `.` or `..` is rejected as well.
pub fn validate_tenant_id(tenant: &str) -> KiaResult<()> {
    const MAX_TENANT_LEN: usize = 253;

    if tenant.trim().is_empty() {
        return Err(KiaError::validation("tenant id cannot be empty"));
    }

    if tenant.len() > MAX_TENANT_LEN {
        return Err(KiaError::validation(format!(
            "tenant id exceeds maximum length of {} characters",
            MAX_TENANT_LEN
        )));
    }

    if tenant == "." || tenant == ".." {
        return Err(KiaError::validation("tenant id cannot be a relative path"));
    }

    let ok = tenant
        .bytes()
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'.' | b'-' | b'_'));

    if !ok {
        return Err(KiaError::validation(
            "tenant id contains invalid characters (only alphanumeric, '.', '-', '_' allowed)",
        ));
    }

    Ok(())
}

/// Rejects non-finite or non-positive measurements.
pub fn positive_measurement(field: &str, value: Option<f64>) -> KiaResult<()> {
    match value {
        Some(v) if !v.is_finite() || v <= 0.0 => Err(KiaError::validation(format!(
            "{} must be a positive number, got {}",
            field, v
        ))),
        _ => Ok(()),
    }
}

/// Rejects a zero reading where one was supplied.
pub fn positive_reading(field: &str, value: Option<u16>) -> KiaResult<()> {
    match value {
        Some(0) => Err(KiaError::validation(format!("{} must be positive", field))),
        _ => Ok(()),
    }
}

/// Trims free text, mapping blank input to `None`.
pub fn clean_note(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Lower-cased alphanumerics of `value`, so `"Very High"`, `"very_high"` and `"VeryHigh"` compare
/// equal when parsing enumerated codes.
pub(crate) fn code_key(value: &str) -> String {
    value
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Requires a non-blank text field.
pub(crate) fn required_text(field: &str, value: &str) -> KiaResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(KiaError::validation(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}
