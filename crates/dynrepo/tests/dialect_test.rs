//! Tests for SQL dialects

use dynrepo::connection::DatabaseType;
use dynrepo::dialect::{dialect_for, PostgresDialect, SqlDialect, SqlServerDialect};
use dynrepo::strategy::NamingConvention;

#[test]
fn test_postgres_placeholder() {
    let dialect = PostgresDialect;

    assert_eq!(dialect.placeholder(1), "$1");
    assert_eq!(dialect.placeholder(12), "$12");
}

#[test]
fn test_sqlserver_placeholder() {
    let dialect = SqlServerDialect;

    assert_eq!(dialect.placeholder(1), "@p1");
    assert_eq!(dialect.placeholder(12), "@p12");
}

#[test]
fn test_window_clauses() {
    assert_eq!(
        PostgresDialect.window_clause("@__offset", "@__limit"),
        " LIMIT @__limit OFFSET @__offset"
    );
    assert_eq!(
        SqlServerDialect.window_clause("@__offset", "@__limit"),
        " OFFSET @__offset ROWS FETCH NEXT @__limit ROWS ONLY"
    );
}

#[test]
fn test_default_order_by() {
    assert_eq!(PostgresDialect.default_order_by(), "1");
    assert_eq!(SqlServerDialect.default_order_by(), "1");
}

#[test]
fn test_parameter_naming() {
    assert_eq!(PostgresDialect.parameter_naming(), NamingConvention::Snake);
    assert_eq!(SqlServerDialect.parameter_naming(), NamingConvention::Pascal);
}

#[test]
fn test_routine_execute_sql() {
    let args = [("@order_id", "$1".to_string())];
    assert_eq!(
        PostgresDialect.routine_execute_sql("sales.archive_order", &args),
        "CALL sales.archive_order(order_id => $1)"
    );

    let args = [
        ("@OrderId", "@p1".to_string()),
        ("@Reason", "@p2".to_string()),
    ];
    assert_eq!(
        SqlServerDialect.routine_execute_sql("dbo.ArchiveOrder", &args),
        "EXEC dbo.ArchiveOrder @OrderId = @p1, @Reason = @p2"
    );
}

#[test]
fn test_bulk_copy_support() {
    assert_eq!(
        PostgresDialect.bulk_copy_sql("orders", &["id", "total"]),
        Some("COPY orders (id, total) FROM STDIN WITH (FORMAT text)".to_string())
    );
    assert_eq!(SqlServerDialect.bulk_copy_sql("Orders", &["Id"]), None);
}

#[test]
fn test_dialect_for() {
    assert_eq!(dialect_for("postgres").name(), "PostgreSQL");
    assert_eq!(dialect_for("postgresql").name(), "PostgreSQL");
    assert_eq!(dialect_for("mssql").name(), "SQL Server");
    assert_eq!(dialect_for("SqlServer").name(), "SQL Server");
    assert_eq!(dialect_for("unknown").name(), "PostgreSQL");
}

#[test]
fn test_database_type_dialect() {
    assert_eq!(DatabaseType::PostgreSQL.dialect().name(), "PostgreSQL");
    assert_eq!(DatabaseType::SqlServer.dialect().name(), "SQL Server");
}
