//! Environment variable handling
//!
//! Two concerns live here: expanding `${VAR_NAME}` references in harness
//! configuration files, and the process-wide binding that tells the driver
//! where its backing store lives.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::ConfigError;

/// Matches `${VAR_NAME}` references
static ENV_VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var pattern"));

/// Expand every `${VAR_NAME}` reference in `input`.
///
/// All unset variables are reported together in a single validation error.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing: Vec<String> = Vec::new();

    let expanded = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        match env::var(name) {
            Ok(value) => value,
            Err(_) => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing.join(", ")
        )));
    }

    Ok(expanded.into_owned())
}

/// A named environment variable that points the driver at a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvBinding {
    name: String,
}

impl EnvBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Point the variable at `path`
    pub fn bind(&self, path: &Path) {
        debug!("Binding {}={:?}", self.name, path);
        env::set_var(&self.name, path);
    }

    /// Current value, if the variable is set and non-empty
    pub fn current(&self) -> Option<PathBuf> {
        env::var_os(&self.name)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    }

    /// Unset the variable. Unsetting an absent variable is a no-op.
    pub fn clear(&self) {
        if env::var_os(&self.name).is_some() {
            debug!("Clearing {}", self.name);
            env::remove_var(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_unchanged() {
        let input = "join_timeout: 10s";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_repeated_variable() {
        env::set_var("HARNESS_TEST_REPEAT", "x");
        let result = substitute_env_vars("${HARNESS_TEST_REPEAT}/${HARNESS_TEST_REPEAT}").unwrap();
        assert_eq!(result, "x/x");
        env::remove_var("HARNESS_TEST_REPEAT");
    }

    #[test]
    fn test_all_missing_variables_reported() {
        let err = substitute_env_vars("${HARNESS_MISSING_A_777} ${HARNESS_MISSING_B_777}")
            .unwrap_err()
            .to_string();
        assert!(err.contains("HARNESS_MISSING_A_777"));
        assert!(err.contains("HARNESS_MISSING_B_777"));
    }

    #[test]
    fn test_bare_dollar_left_alone() {
        let result = substitute_env_vars("$HOME and {HOME}").unwrap();
        assert_eq!(result, "$HOME and {HOME}");
    }

    #[test]
    fn test_binding_lifecycle() {
        let binding = EnvBinding::new("HARNESS_TEST_BINDING_LIFECYCLE");
        assert_eq!(binding.current(), None);

        binding.bind(Path::new("/tmp/store"));
        assert_eq!(binding.current(), Some(PathBuf::from("/tmp/store")));

        binding.clear();
        assert_eq!(binding.current(), None);

        // Clearing twice is fine
        binding.clear();
    }
}
