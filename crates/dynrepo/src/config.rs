//! Repository configuration
//!
//! Loaded from YAML with `${VAR}` / `${VAR:-default}` environment expansion.
//! Every section is optional and falls back to its defaults.
//!
//! ```yaml
//! retry:
//!   max_retries: 5
//!   base_delay_ms: 100
//! command:
//!   timeout_secs: 15
//! connection_strings:
//!   sales: ${SALES_DB_URL:-postgres://localhost/sales}
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::strategy::{NamingConvention, ParameterStrategy};

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Retry policy
    pub retry: RetrySettings,
    /// Command execution
    pub command: CommandSettings,
    /// Pagination bounds
    pub pagination: PaginationSettings,
    /// Filter and procedure parameter rendering
    pub parameters: ParameterSettings,
    /// Logical name → connection URL
    pub connection_strings: HashMap<String, String>,
}

/// Retry settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retry transient failures
    pub enabled: bool,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// First retry delay in milliseconds
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds
    pub max_delay_ms: u64,
    /// Exponential (true) or constant (false) backoff
    pub exponential: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 30_000,
            exponential: true,
        }
    }
}

/// Command settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandSettings {
    /// Default command timeout in seconds
    pub timeout_secs: u64,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Application name reported to the server
    pub application_name: Option<String>,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_ms: 10_000,
            application_name: None,
        }
    }
}

/// Pagination settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PaginationSettings {
    /// Largest accepted page size
    pub max_page_size: u32,
}

impl Default for PaginationSettings {
    fn default() -> Self {
        Self {
            max_page_size: 1000,
        }
    }
}

/// Parameter rendering settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ParameterSettings {
    /// Filter strategy for inline SQL
    pub text_strategy: ParameterStrategy,
    /// Filter strategy for stored procedures
    pub procedure_strategy: ParameterStrategy,
    /// Parameter naming; the dialect's convention when unset
    pub naming: Option<NamingConvention>,
    /// Name of the JSON filter parameter
    pub filter_blob_name: String,
    /// Column carrying the total row count in paged procedure results
    pub total_count_column: String,
}

impl Default for ParameterSettings {
    fn default() -> Self {
        Self {
            text_strategy: ParameterStrategy::Individual,
            procedure_strategy: ParameterStrategy::Json,
            naming: None,
            filter_blob_name: "Filters".to_string(),
            total_count_column: "TotalCount".to_string(),
        }
    }
}

impl RepositoryConfig {
    /// Parse YAML after environment expansion
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| Error::config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::config(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.command.timeout_secs == 0 {
            return Err(Error::config("command.timeout_secs must be positive"));
        }
        if self.pagination.max_page_size == 0 {
            return Err(Error::config("pagination.max_page_size must be positive"));
        }
        if self.parameters.filter_blob_name.trim().is_empty() {
            return Err(Error::config("parameters.filter_blob_name must not be empty"));
        }
        if self.parameters.total_count_column.trim().is_empty() {
            return Err(Error::config(
                "parameters.total_count_column must not be empty",
            ));
        }
        Ok(())
    }

    /// Default command timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command.timeout_secs)
    }
}

/// Resolves a logical connection name to a connection URL
pub trait ConnectionStringResolver: Send + Sync {
    /// Resolve `name`; unknown names are configuration errors
    fn resolve(&self, name: &str) -> Result<String>;
}

/// Resolver backed by the `connection_strings` config section
#[derive(Debug, Clone, Default)]
pub struct ConfigConnectionStrings {
    strings: HashMap<String, String>,
}

impl ConfigConnectionStrings {
    /// Wrap a name → URL map
    pub fn new(strings: HashMap<String, String>) -> Self {
        Self { strings }
    }

    /// Use the strings from a loaded config
    pub fn from_config(config: &RepositoryConfig) -> Self {
        Self::new(config.connection_strings.clone())
    }
}

impl ConnectionStringResolver for ConfigConnectionStrings {
    fn resolve(&self, name: &str) -> Result<String> {
        match self.strings.get(name) {
            Some(url) if !url.trim().is_empty() => Ok(url.clone()),
            Some(_) => Err(Error::config(format!(
                "connection string '{}' is empty",
                name
            ))),
            None => Err(Error::config(format!(
                "connection string '{}' is not configured",
                name
            ))),
        }
    }
}
