//! SQL dialect abstraction for dynrepo
//!
//! The repository composes SQL text around caller-supplied statements, so a
//! dialect only has to answer a handful of vendor questions:
//!
//! - Positional placeholder syntax (`$1`, `@p1`)
//! - Window clause for pagination (`LIMIT/OFFSET`, `OFFSET/FETCH`)
//! - Routine invocation syntax
//! - Preferred parameter naming convention
//! - Bulk-copy statement text

use crate::strategy::NamingConvention;

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync + std::fmt::Debug {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Get the placeholder for a 1-based parameter position
    fn placeholder(&self, index: usize) -> String;

    /// Window clause appended to an ordered statement.
    ///
    /// Both arguments are named parameter references (e.g. `@__offset`),
    /// never literals.
    fn window_clause(&self, offset_param: &str, limit_param: &str) -> String;

    /// Ordering used when pagination has no caller-supplied sort
    fn default_order_by(&self) -> &'static str {
        "1"
    }

    /// Naming convention for rendered routine and filter parameters
    fn parameter_naming(&self) -> NamingConvention;

    /// Statement that calls a routine and returns its rows.
    ///
    /// `args` pair each normalized parameter name (`@name`) with the
    /// positional placeholder carrying its value.
    fn routine_query_sql(&self, routine: &str, args: &[(&str, String)]) -> String;

    /// Statement that invokes a routine for its side effects
    fn routine_execute_sql(&self, routine: &str, args: &[(&str, String)]) -> String;

    /// Bulk-copy statement for the given (validated) table and columns, if
    /// the dialect has a text-level bulk protocol
    fn bulk_copy_sql(&self, table: &str, columns: &[&str]) -> Option<String>;
}

fn bare(param: &str) -> &str {
    param.trim_start_matches('@')
}

// ===========================================================================
// PostgreSQL
// ===========================================================================

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    fn named_arguments(args: &[(&str, String)]) -> String {
        args.iter()
            .map(|(name, placeholder)| format!("{} => {}", bare(name), placeholder))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn window_clause(&self, offset_param: &str, limit_param: &str) -> String {
        format!(" LIMIT {} OFFSET {}", limit_param, offset_param)
    }

    fn parameter_naming(&self) -> NamingConvention {
        NamingConvention::Snake
    }

    fn routine_query_sql(&self, routine: &str, args: &[(&str, String)]) -> String {
        format!("SELECT * FROM {}({})", routine, Self::named_arguments(args))
    }

    fn routine_execute_sql(&self, routine: &str, args: &[(&str, String)]) -> String {
        format!("CALL {}({})", routine, Self::named_arguments(args))
    }

    fn bulk_copy_sql(&self, table: &str, columns: &[&str]) -> Option<String> {
        Some(format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
            table,
            columns.join(", ")
        ))
    }
}

// ===========================================================================
// SQL Server
// ===========================================================================

/// SQL Server dialect
#[derive(Debug, Clone, Default)]
pub struct SqlServerDialect;

impl SqlServerDialect {
    fn exec(routine: &str, args: &[(&str, String)]) -> String {
        if args.is_empty() {
            return format!("EXEC {}", routine);
        }
        let args: Vec<_> = args
            .iter()
            .map(|(name, placeholder)| format!("{} = {}", name, placeholder))
            .collect();
        format!("EXEC {} {}", routine, args.join(", "))
    }
}

impl SqlDialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "SQL Server"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@p{}", index)
    }

    fn window_clause(&self, offset_param: &str, limit_param: &str) -> String {
        // OFFSET-FETCH requires ORDER BY, which the composer guarantees
        format!(
            " OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
            offset_param, limit_param
        )
    }

    fn parameter_naming(&self) -> NamingConvention {
        NamingConvention::Pascal
    }

    fn routine_query_sql(&self, routine: &str, args: &[(&str, String)]) -> String {
        Self::exec(routine, args)
    }

    fn routine_execute_sql(&self, routine: &str, args: &[(&str, String)]) -> String {
        Self::exec(routine, args)
    }

    fn bulk_copy_sql(&self, _table: &str, _columns: &[&str]) -> Option<String> {
        // TDS bulk load is a protocol-level operation with no statement text
        None
    }
}

/// Get a dialect instance by database type name
pub fn dialect_for(name: &str) -> Box<dyn SqlDialect> {
    match name.to_lowercase().as_str() {
        "sqlserver" | "mssql" => Box::new(SqlServerDialect),
        _ => Box::new(PostgresDialect), // Default to PostgreSQL
    }
}
