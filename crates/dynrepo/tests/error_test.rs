//! Tests for the dynrepo error taxonomy

use dynrepo::error::{Error, ErrorCategory, ErrorLayer, SanitizerLayer};

#[test]
fn test_error_connection() {
    let err = Error::connection("Failed to connect");

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert_eq!(err.layer(), ErrorLayer::Provider);
    assert!(err.to_string().contains("Failed to connect"));
    assert!(err.is_retriable());
}

#[test]
fn test_error_config() {
    let err = Error::config("connection string 'sales' is not configured");

    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert_eq!(err.layer(), ErrorLayer::Configuration);
    assert!(!err.is_retriable());
}

#[test]
fn test_error_query() {
    let err = Error::query("Syntax error in SQL");

    assert_eq!(err.category(), ErrorCategory::Query);
    assert!(err.to_string().contains("Syntax error"));
    assert!(!err.is_retriable());
}

#[test]
fn test_transient_categories() {
    assert!(Error::timeout("command exceeded 30s").is_retriable());
    assert!(Error::deadlock("40P01").is_retriable());
    assert!(Error::PoolExhausted {
        message: "too many clients".into()
    }
    .is_retriable());

    assert!(!Error::transaction("already completed").is_retriable());
    assert!(!Error::type_conversion("not an integer").is_retriable());
    assert!(!Error::Cancelled.is_retriable());
}

#[test]
fn test_error_constraint() {
    let err = Error::Constraint {
        constraint_name: "users_email_key".to_string(),
        message: "duplicate key value".to_string(),
    };

    assert_eq!(err.category(), ErrorCategory::Constraint);
    assert!(!err.is_retriable());
}

#[test]
fn test_validation_layer() {
    let err = Error::validation("page size 0 out of range");
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert_eq!(err.layer(), ErrorLayer::Validation);

    assert_eq!(Error::Cancelled.layer(), ErrorLayer::Validation);
    assert_eq!(Error::Cancelled.category(), ErrorCategory::Cancelled);
}

#[test]
fn test_unsafe_identifier() {
    let err = Error::unsafe_identifier("Name;", SanitizerLayer::Whitelist, "contains ';'");

    assert_eq!(err.layer(), ErrorLayer::Sanitizer);
    assert_eq!(err.category(), ErrorCategory::Validation);
    let display = err.to_string();
    assert!(display.contains("Name;"));
    assert!(display.contains("whitelist"));
}

#[test]
fn test_multiple_rows_is_query_error() {
    let err = Error::MultipleRows {
        sql: "SELECT * FROM t".into(),
    };
    assert_eq!(err.category(), ErrorCategory::Query);
    assert_eq!(err.layer(), ErrorLayer::Provider);
}

#[test]
fn test_unsupported() {
    let err = Error::unsupported("SQL Server has no text-level bulk copy");

    assert_eq!(err.category(), ErrorCategory::Other);
    assert_eq!(err.layer(), ErrorLayer::Configuration);
}

#[test]
fn test_query_with_sql() {
    let err = Error::query_with_sql("Syntax error", "SELECT * FORM users");

    assert_eq!(err.category(), ErrorCategory::Query);
    assert!(err.to_string().contains("Syntax error"));
}

#[test]
fn test_category_display() {
    assert_eq!(ErrorCategory::Deadlock.to_string(), "deadlock");
    assert_eq!(ErrorLayer::Sanitizer.to_string(), "sanitizer");
}
