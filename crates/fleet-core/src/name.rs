//! Service name rules.
//!
//! A service name ends up in row keys (`{name}:{id}`), in directory names
//! under the state directory, and in cluster names handed to provisioning
//! commands. Restricting it to lowercase letters, digits, and `-` keeps all
//! three unambiguous.

use crate::error::{ConfigError, ConfigResult};

/// Longest accepted service name.
pub const MAX_SERVICE_NAME_LEN: usize = 48;

/// Check that `name` can be used as a service name.
pub fn validate_service_name(name: &str) -> ConfigResult<()> {
    let invalid = |reason: &str| {
        Err(ConfigError::InvalidServiceName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    let Some(first) = name.chars().next() else {
        return invalid("name is empty");
    };
    if !first.is_ascii_lowercase() {
        return invalid("must start with a lowercase letter");
    }
    if name.len() > MAX_SERVICE_NAME_LEN {
        return invalid(&format!("longer than {MAX_SERVICE_NAME_LEN} characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return invalid("only lowercase letters, digits, and '-' are allowed");
    }
    Ok(())
}
