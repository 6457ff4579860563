//! Command descriptors and per-call options

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::dialect::SqlDialect;
use crate::error::Result;
use crate::params::{BoundStatement, ParameterBinder, Params};
use crate::strategy::ParameterStrategy;

/// How the command text is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandKind {
    /// Inline SQL text
    #[default]
    Text,
    /// Stored procedure or function name
    StoredProcedure,
}

/// Caller options accepted by every repository operation
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Per-command timeout; falls back to the configured default
    pub timeout: Option<Duration>,
    /// Text or stored procedure
    pub kind: CommandKind,
    /// Overrides the configured filter parameter strategy
    pub filter_strategy: Option<ParameterStrategy>,
    /// Record the first `FROM` target of a paged query under
    /// `PagedResult::metadata["table"]`. Other operations ignore it.
    pub capture_table_name: bool,
    /// Cooperative cancellation
    pub cancellation: CancellationToken,
}

impl CommandOptions {
    /// Default options (inline text)
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a stored procedure call
    pub fn stored_procedure() -> Self {
        Self {
            kind: CommandKind::StoredProcedure,
            ..Self::default()
        }
    }

    /// Set the command timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Force a filter parameter strategy
    pub fn with_filter_strategy(mut self, strategy: ParameterStrategy) -> Self {
        self.filter_strategy = Some(strategy);
        self
    }

    /// Capture the queried table name into paged result metadata
    pub fn capture_table_name(mut self) -> Self {
        self.capture_table_name = true;
        self
    }

    /// Attach a cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// A single command, bound once into an immutable statement that every
/// attempt re-sends
#[derive(Debug, Clone)]
pub struct Command {
    /// SQL with named `@param` references
    pub sql: String,
    /// Text or stored procedure
    pub kind: CommandKind,
    /// Effective timeout
    pub timeout: Duration,
    /// Named parameters
    pub params: Params,
}

impl Command {
    /// Create a command
    pub fn new(sql: impl Into<String>, kind: CommandKind, timeout: Duration, params: Params) -> Self {
        Self {
            sql: sql.into(),
            kind,
            timeout,
            params,
        }
    }

    /// Bind named parameters into dialect placeholders
    pub fn bind(&self, dialect: &dyn SqlDialect) -> Result<BoundStatement> {
        ParameterBinder::new(dialect).bind(&self.sql, &self.params)
    }

    /// Short single-line rendering for logs
    pub fn shape(&self) -> String {
        sql_shape(&self.sql)
    }
}

const SHAPE_MAX_CHARS: usize = 120;

/// Collapse whitespace and truncate SQL for log output
pub fn sql_shape(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= SHAPE_MAX_CHARS {
        return collapsed;
    }
    let mut shape: String = collapsed.chars().take(SHAPE_MAX_CHARS).collect();
    shape.push_str("...");
    shape
}
