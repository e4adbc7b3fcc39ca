//! Config path and secret resolution
//!
//! Precedence everywhere: explicit CLI value > environment variable > file or
//! default. Secrets are never read from the TOML itself.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::secret::Secret;

/// Resolve the config file path from a CLI arg, then `env_var`, then `default`.
pub fn resolve_config_path(cli_path: Option<&str>, env_var: &str, default: &str) -> PathBuf {
    if let Some(p) = cli_path {
        return PathBuf::from(p);
    }
    if let Ok(p) = std::env::var(env_var) {
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    PathBuf::from(default)
}

/// Resolve a secret from `env_var`, falling back to the contents of `file`.
///
/// Both sources are trimmed. An empty env var or file yields `None`.
pub fn resolve_secret(env_var: &str, file: Option<&Path>) -> Result<Option<Secret<String>>> {
    if let Ok(value) = std::env::var(env_var) {
        let value = value.trim();
        if !value.is_empty() {
            return Ok(Some(Secret::new(value.to_owned())));
        }
    }

    let Some(path) = file else {
        return Ok(None);
    };
    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("failed to read secret file {}: {e}", path.display()))
    })?;
    let value = contents.trim().to_owned();
    if value.is_empty() {
        return Ok(None);
    }
    Ok(Some(Secret::new(value)))
}
