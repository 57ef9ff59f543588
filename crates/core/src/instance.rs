//! Shaping of a source instance's settings for its clone.

use std::collections::BTreeMap;

use crate::error::{DomainError, DomainResult};
use crate::id::MAX_INSTANCE_NAME_LEN;

/// Reserved configuration namespace for runtime-assigned, per-instance values
/// (MAC addresses, idmaps, last power state, ...).
pub const VOLATILE_PREFIX: &str = "volatile.";

/// The one volatile key that describes the image, not the instance.
pub const VOLATILE_KEEP: &str = "volatile.base_image";

/// Environment every producer command starts from.
pub const DEFAULT_EXEC_ENV: [(&str, &str); 2] = [("HOME", "/root"), ("USER", "root")];

/// Check a name against the runtime's instance naming rules: 1 to 63 ASCII
/// letters, digits or `-`, not starting or ending with `-`.
///
/// Names end up in request paths, so anything else is refused up front.
pub fn validate_instance_name(name: &str) -> DomainResult<()> {
    if name.is_empty() {
        return Err(DomainError::validation("name must not be empty"));
    }
    if name.len() > MAX_INSTANCE_NAME_LEN {
        return Err(DomainError::validation(format!(
            "name longer than {MAX_INSTANCE_NAME_LEN} characters"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(DomainError::validation(format!(
            "name {name:?} may only contain ASCII letters, digits and '-'"
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(DomainError::validation(format!(
            "name {name:?} must not start or end with '-'"
        )));
    }
    Ok(())
}

/// Remove every volatile key except [`VOLATILE_KEEP`]; returns the removed keys.
pub fn strip_volatile_keys(config: &mut BTreeMap<String, String>) -> Vec<String> {
    let removed: Vec<String> = config
        .keys()
        .filter(|k| k.starts_with(VOLATILE_PREFIX) && k.as_str() != VOLATILE_KEEP)
        .cloned()
        .collect();

    for key in &removed {
        config.remove(key);
    }

    removed
}

/// Merge job-level environment overrides on top of [`DEFAULT_EXEC_ENV`].
pub fn exec_environment(overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = DEFAULT_EXEC_ENV
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}
