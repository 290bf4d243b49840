//! Secret references in `labelflow.yaml`.
//!
//! `env:NAME` reads an environment variable; any other value is used as is.

use workflow::ConfigError;

const ENV_PREFIX: &str = "env:";

/// Resolve a secret reference to its value.
pub fn resolve(reference: &str) -> Result<String, ConfigError> {
    let Some(name) = reference.strip_prefix(ENV_PREFIX) else {
        return Ok(reference.to_string());
    };

    let name = name.trim();
    if name.is_empty() {
        return Err(ConfigError::Secret {
            reference: reference.to_string(),
            reason: "missing variable name".to_string(),
        });
    }

    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        Ok(_) => Err(ConfigError::Secret {
            reference: reference.to_string(),
            reason: format!("{name} is empty"),
        }),
        Err(e) => Err(ConfigError::Secret {
            reference: reference.to_string(),
            reason: format!("{name}: {e}"),
        }),
    }
}
