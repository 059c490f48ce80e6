//! Configuration for include resolution

use serde::Deserialize;

use crate::error::{ModelError, ModelResult};

/// Environment variable holding the maximum include nesting depth
pub const ENV_MAX_DEPTH: &str = "ELIF_INCLUDE_MAX_DEPTH";
/// Environment variable holding the maximum number of keys per `inq` fetch
pub const ENV_IN_SET_LIMIT: &str = "ELIF_INCLUDE_IN_SET_LIMIT";
/// Environment variable toggling concurrent sibling branches
pub const ENV_PARALLEL: &str = "ELIF_INCLUDE_PARALLEL";

/// Configuration for the inclusion resolver
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IncludeConfig {
    /// Maximum depth of nested includes accepted in one request
    pub max_depth: usize,
    /// Maximum number of keys sent in a single `inq` condition (`None` = unlimited)
    pub in_set_limit: Option<usize>,
    /// Dispatch sibling include branches concurrently
    pub parallel_branches: bool,
}

impl Default for IncludeConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            in_set_limit: None,
            parallel_branches: true,
        }
    }
}

impl IncludeConfig {
    /// Load configuration from `ELIF_INCLUDE_*` environment variables,
    /// falling back to defaults for anything unset
    pub fn from_env() -> ModelResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> ModelResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MAX_DEPTH) {
            config.max_depth = parse_number(ENV_MAX_DEPTH, &raw)?;
        }

        if let Some(raw) = lookup(ENV_IN_SET_LIMIT) {
            let limit = parse_number(ENV_IN_SET_LIMIT, &raw)?;
            config.in_set_limit = if limit == 0 { None } else { Some(limit) };
        }

        if let Some(raw) = lookup(ENV_PARALLEL) {
            config.parallel_branches = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ModelError::Configuration(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_PARALLEL, other
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the maximum include depth
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Limit the number of keys per `inq` fetch
    pub fn with_in_set_limit(mut self, limit: usize) -> Self {
        self.in_set_limit = Some(limit);
        self
    }

    /// Enable or disable concurrent sibling branches
    pub fn with_parallel_branches(mut self, parallel: bool) -> Self {
        self.parallel_branches = parallel;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> ModelResult<()> {
        if self.max_depth == 0 {
            return Err(ModelError::Configuration(
                "Include max_depth must be at least 1".to_string(),
            ));
        }

        if self.in_set_limit == Some(0) {
            return Err(ModelError::Configuration(
                "Include in_set_limit must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_number(key: &str, raw: &str) -> ModelResult<usize> {
    raw.trim().parse::<usize>().map_err(|_| {
        ModelError::Configuration(format!("{} must be a non-negative integer, got '{}'", key, raw))
    })
}
