// src/core/protocol/validate.rs

//! Identifier validation shared by the codec and the service layers.
//!
//! AppIDs, pool names, and trigger names are printable ASCII drawn from
//! `[A-Za-z0-9._-]`. Limits are enforced before a message reaches any
//! higher layer.

use crate::core::LatZeroError;

/// Maximum length of an application identifier.
pub const MAX_APP_ID_LEN: usize = 128;
/// Maximum length of a pool name.
pub const MAX_POOL_NAME_LEN: usize = 64;
/// Maximum length of a trigger name.
pub const MAX_TRIGGER_NAME_LEN: usize = 128;

fn is_valid_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn check_ident(kind: &str, value: &str, max_len: usize) -> Result<(), LatZeroError> {
    if value.is_empty() {
        return Err(LatZeroError::Validation(format!("{kind} must not be empty")));
    }
    if value.len() > max_len {
        return Err(LatZeroError::Validation(format!(
            "{kind} '{value}' exceeds {max_len} characters"
        )));
    }
    if let Some(bad) = value.chars().find(|c| !is_valid_ident_char(*c)) {
        return Err(LatZeroError::Validation(format!(
            "{kind} '{value}' contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

/// Validates an application identifier (1-128 chars of `[A-Za-z0-9._-]`).
pub fn validate_app_id(value: &str) -> Result<(), LatZeroError> {
    check_ident("app_id", value, MAX_APP_ID_LEN)
}

/// Validates a pool name (1-64 chars of `[A-Za-z0-9._-]`).
pub fn validate_pool_name(value: &str) -> Result<(), LatZeroError> {
    check_ident("pool", value, MAX_POOL_NAME_LEN)
}

/// Validates a trigger name (1-128 chars of `[A-Za-z0-9._-]`).
pub fn validate_trigger_name(value: &str) -> Result<(), LatZeroError> {
    check_ident("trigger", value, MAX_TRIGGER_NAME_LEN)
}
