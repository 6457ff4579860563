//! Dynamic SQL composition for pagination, filtering and counting
//!
//! The composer wraps caller SQL without parsing it. Structural checks run on
//! a masked copy of the statement (literals, comments and sub-queries blanked)
//! so that an `ORDER BY` inside a string or a nested select is never mistaken
//! for the statement's own ordering.

use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::filter::{PageRequest, SortSpec};
use crate::params::{mask_comments, mask_literals, mask_nested, BoundStatement, Params};
use crate::security::{validate_sql_identifier, IdentifierSanitizer};

/// Bound parameter carrying the page offset
pub const OFFSET_PARAM: &str = "@__offset";
/// Bound parameter carrying the page size
pub const LIMIT_PARAM: &str = "@__limit";

static ORDER_BY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\border\s+by\b").unwrap());

static WINDOW_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(limit|offset|fetch)\b").unwrap());

static WINDOW_CLAUSE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:limit\s+(?:\d|all\b|[@$:?])|offset\s+(?:\d|[@$:?])|fetch\s+(?:first|next)\b)")
        .unwrap()
});

static FROM_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bfrom\s+([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?)").unwrap()
});

/// Routine call flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineCall {
    /// Routine returns rows
    Query,
    /// Routine is invoked for side effects
    Execute,
}

/// Builds paginated, filtered, count and routine SQL
#[derive(Debug, Clone)]
pub struct QueryComposer {
    dialect: Arc<dyn SqlDialect>,
    sanitizer: IdentifierSanitizer,
}

impl QueryComposer {
    /// Create a composer for a dialect
    pub fn new(dialect: Arc<dyn SqlDialect>) -> Self {
        Self {
            dialect,
            sanitizer: IdentifierSanitizer::new(),
        }
    }

    /// Dialect in use
    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// Require exactly one statement. A single trailing `;` and any trailing
    /// comments are removed, so appended clauses never land inside a comment.
    pub fn single_statement(&self, sql: &str) -> Result<String> {
        let masked = mask_literals(sql);
        let statement = match masked.find(';') {
            None => sql.trim(),
            Some(pos) if masked[pos + 1..].trim().is_empty() => sql[..pos].trim(),
            Some(_) => {
                return Err(Error::validation(
                    "dynamic composition requires a single SQL statement",
                ))
            }
        };
        let uncommented = mask_comments(statement);
        let statement = statement[..uncommented.trim_end().len()].trim_end();
        if statement.is_empty() {
            return Err(Error::validation("SQL text is empty"));
        }
        Ok(statement.to_string())
    }

    /// Whether the statement carries its own top-level `ORDER BY`
    pub fn has_top_level_order_by(&self, sql: &str) -> bool {
        top_level_order_by(sql).is_some()
    }

    /// ` ORDER BY <column> <dir>` from a sanitized sort, or the dialect default
    pub fn order_clause(&self, sort: Option<&SortSpec>) -> Result<String> {
        match sort {
            Some(sort) => {
                let column = self.sanitizer.sanitize(&sort.column)?;
                Ok(format!(" ORDER BY {} {}", column, sort.direction.as_sql()))
            }
            None => Ok(format!(" ORDER BY {}", self.dialect.default_order_by())),
        }
    }

    /// Statement with an `ORDER BY` guaranteed, no window
    pub fn filtered_sql(&self, sql: &str, sort: Option<&SortSpec>) -> Result<String> {
        let statement = self.single_statement(sql)?;
        // validated even when the statement keeps its own ordering
        let order = self.order_clause(sort)?;
        if self.has_top_level_order_by(&statement) {
            Ok(statement)
        } else {
            Ok(format!("{}{}", statement, order))
        }
    }

    /// Ordered statement plus the dialect window clause. A statement that
    /// already limits its rows is rejected.
    pub fn paged_sql(&self, sql: &str, sort: Option<&SortSpec>) -> Result<String> {
        let statement = self.single_statement(sql)?;
        if has_window_clause(&statement) {
            return Err(Error::validation(
                "paged SQL must not carry its own LIMIT, OFFSET or FETCH clause",
            ));
        }
        let ordered = self.filtered_sql(&statement, sort)?;
        Ok(format!(
            "{}{}",
            ordered,
            self.dialect.window_clause(OFFSET_PARAM, LIMIT_PARAM)
        ))
    }

    /// Offset and limit parameters for a page
    pub fn page_params(&self, page: &PageRequest) -> Params {
        Params::new()
            .with(OFFSET_PARAM, page.offset())
            .with(LIMIT_PARAM, i64::from(page.page_size))
    }

    /// `SELECT COUNT(*) FROM (<statement without trailing ORDER BY>) AS CountQuery`
    pub fn count_sql(&self, sql: &str) -> Result<String> {
        let statement = self.single_statement(sql)?;
        let stripped = strip_trailing_order_by(&statement);
        let inner = if stripped.is_empty() {
            statement.as_str()
        } else {
            stripped
        };
        Ok(format!("SELECT COUNT(*) FROM ({}) AS CountQuery", inner))
    }

    /// First top-level `FROM` target, if it is a plain (optionally qualified) name
    pub fn capture_table_name(&self, sql: &str) -> Option<String> {
        let masked = mask_nested(&mask_literals(sql));
        FROM_REGEX
            .captures(&masked)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Bound routine invocation passing every parameter by name
    pub fn procedure_statement(
        &self,
        routine: &str,
        params: &Params,
        call: RoutineCall,
    ) -> Result<BoundStatement> {
        let routine = self.sanitizer.sanitize_routine_name(routine)?;

        let mut args = Vec::with_capacity(params.len());
        let mut names = Vec::with_capacity(params.len());
        let mut values = Vec::with_capacity(params.len());
        for (index, (name, value)) in params.iter().enumerate() {
            validate_sql_identifier(name.trim_start_matches('@'))?;
            args.push((name, self.dialect.placeholder(index + 1)));
            names.push(name.to_string());
            values.push(value.clone());
        }

        let sql = match call {
            RoutineCall::Query => self.dialect.routine_query_sql(&routine, &args),
            RoutineCall::Execute => self.dialect.routine_execute_sql(&routine, &args),
        };
        Ok(BoundStatement { sql, values, names })
    }
}

/// Byte offset of the last top-level `ORDER BY`
fn top_level_order_by(sql: &str) -> Option<usize> {
    let masked = mask_nested(&mask_literals(sql));
    ORDER_BY_REGEX.find_iter(&masked).last().map(|m| m.start())
}

/// Whether the statement restricts its own top-level rows
fn has_window_clause(statement: &str) -> bool {
    let masked = mask_nested(&mask_literals(statement));
    WINDOW_CLAUSE_REGEX.is_match(&masked)
}

/// Remove a trailing top-level `ORDER BY`. Orderings followed by a window
/// clause are kept, since they decide which rows are counted.
fn strip_trailing_order_by(statement: &str) -> &str {
    match top_level_order_by(statement) {
        Some(pos) => {
            let masked = mask_nested(&mask_literals(&statement[pos..]));
            if WINDOW_REGEX.is_match(&masked) {
                statement
            } else {
                statement[..pos].trim_end()
            }
        }
        None => statement,
    }
}
