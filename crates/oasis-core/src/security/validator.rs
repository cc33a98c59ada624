//! Boundary validation for caller-supplied parameters

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{OasisError, OasisResult};
use crate::security::{Permission, PermissionSet};

/// Shortest lifetime of a temporary token
pub const MIN_TEMPORARY_HOURS: u32 = 1;

/// Longest lifetime of a temporary token (30 days)
pub const MAX_TEMPORARY_HOURS: u32 = 720;

const MAX_ROLE_NAME_LEN: usize = 64;
const MAX_COMMUNITY_NAME_LEN: usize = 100;
const MAX_ID_LEN: usize = 128;

static HEX_COLOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#[0-9a-fA-F]{6}$").expect("valid color regex"));

/// Reject durations outside 1..=720 hours instead of clamping
pub fn validate_duration_hours(hours: u32) -> OasisResult<()> {
    if !(MIN_TEMPORARY_HOURS..=MAX_TEMPORARY_HOURS).contains(&hours) {
        return Err(OasisError::Validation(format!(
            "durationHours must be between {} and {}, got {}",
            MIN_TEMPORARY_HOURS, MAX_TEMPORARY_HOURS, hours
        )));
    }
    Ok(())
}

/// `None` means unlimited; a ceiling must be positive
pub fn validate_max_uses(max_uses: Option<i64>) -> OasisResult<()> {
    match max_uses {
        Some(n) if n <= 0 => Err(OasisError::Validation(format!(
            "maxUses must be a positive integer, got {}",
            n
        ))),
        _ => Ok(()),
    }
}

/// Identifiers are opaque but must be non-empty and bounded
pub fn validate_id(field: &str, value: &str) -> OasisResult<()> {
    if value.trim().is_empty() {
        return Err(OasisError::Validation(format!("{} cannot be empty", field)));
    }
    if value.len() > MAX_ID_LEN {
        return Err(OasisError::Validation(format!("{} is too long", field)));
    }
    Ok(())
}

/// Trimmed, non-empty, bounded role name
pub fn validate_role_name(name: &str) -> OasisResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(OasisError::Validation("Role name cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_ROLE_NAME_LEN {
        return Err(OasisError::Validation(format!(
            "Role name cannot exceed {} characters",
            MAX_ROLE_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

pub fn validate_community_name(name: &str) -> OasisResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(OasisError::Validation(
            "Community name cannot be empty".to_string(),
        ));
    }
    if name.chars().count() > MAX_COMMUNITY_NAME_LEN {
        return Err(OasisError::Validation(format!(
            "Community name cannot exceed {} characters",
            MAX_COMMUNITY_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

/// Display colour, `#RRGGBB`
pub fn validate_color(color: Option<&str>) -> OasisResult<()> {
    match color {
        Some(c) if !HEX_COLOR.is_match(c) => Err(OasisError::Validation(format!(
            "Invalid role color: {}",
            c
        ))),
        _ => Ok(()),
    }
}

/// Parse permission strings, rejecting any unknown tag
pub fn parse_permissions<S: AsRef<str>>(names: &[S]) -> OasisResult<PermissionSet> {
    names
        .iter()
        .map(|name| {
            name.as_ref()
                .parse::<Permission>()
                .map_err(OasisError::Validation)
        })
        .collect()
}
