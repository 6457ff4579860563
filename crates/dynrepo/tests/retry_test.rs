//! Tests for retry behavior through the repository

use std::sync::Arc;
use std::time::Duration;

use dynrepo::command::CommandOptions;
use dynrepo::config::{RepositoryConfig, RetrySettings};
use dynrepo::connection::Connection;
use dynrepo::error::{Error, ErrorCategory};
use dynrepo::params::Params;
use dynrepo::retry::RetryPolicy;
use dynrepo::testing::MockDatabase;
use dynrepo::types::Row;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dynrepo=debug")),
        )
        .with_test_writer()
        .try_init();
}

fn fast(max_retries: u32) -> RetryPolicy {
    RetryPolicy::from_settings(&RetrySettings {
        max_retries,
        base_delay_ms: 1,
        max_delay_ms: 2,
        ..RetrySettings::default()
    })
}

#[tokio::test]
async fn test_two_transient_failures_then_success() {
    init_tracing();
    let db = MockDatabase::new().with_rows(vec![Row::from_pairs([("n", 1)])]);
    db.fail_next(Error::deadlock("deadlock detected"));
    db.fail_next(Error::timeout("statement timeout"));
    let repo = db.repository().with_retry_policy(fast(3));

    let rows: Vec<Row> = repo
        .query("SELECT 1 AS n", &Params::new(), &CommandOptions::new())
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(db.statements().len(), 3);
    // every attempt gets its own connection, and each is closed
    assert_eq!(db.connections_opened(), 3);
    assert_eq!(db.connections_closed(), 3);
}

#[tokio::test]
async fn test_retries_exhausted_returns_last_error() {
    let db = MockDatabase::new();
    for _ in 0..5 {
        db.fail_next(Error::connection("connection reset"));
    }
    let repo = db.repository().with_retry_policy(fast(2));

    let err = repo
        .execute("DELETE FROM t", &Params::new(), &CommandOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert_eq!(db.statements().len(), 3);
}

#[tokio::test]
async fn test_fatal_error_not_retried() {
    let db = MockDatabase::new();
    db.fail_next(Error::Constraint {
        constraint_name: "orders_pkey".into(),
        message: "duplicate key".into(),
    });
    let repo = db.repository().with_retry_policy(fast(3));

    let err = repo
        .execute("INSERT INTO orders (id) VALUES (1)", &Params::new(), &CommandOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Constraint);
    assert_eq!(db.statements().len(), 1);
}

#[tokio::test]
async fn test_disabled_retry_from_config() {
    let db = MockDatabase::new();
    db.fail_next(Error::deadlock("40P01"));
    let config = RepositoryConfig {
        retry: RetrySettings {
            enabled: false,
            ..RetrySettings::default()
        },
        ..RepositoryConfig::default()
    };
    let repo = db.repository_with(&config);

    assert!(repo
        .execute("UPDATE t SET x = 1", &Params::new(), &CommandOptions::new())
        .await
        .is_err());
    assert_eq!(db.statements().len(), 1);
}

#[tokio::test]
async fn test_no_retry_inside_ambient_transaction() {
    let db = MockDatabase::new();
    let connection = db.connection();
    let transaction = connection.begin().await.unwrap();
    db.fail_next(Error::deadlock("40P01"));

    let mut repo = db.repository().with_retry_policy(fast(3));
    repo.set_transaction(Arc::from(transaction));

    let err = repo
        .execute("UPDATE t SET x = 1", &Params::new(), &CommandOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Deadlock);
    assert_eq!(db.statements().len(), 1);
    assert!(db.statements()[0].in_transaction);
}

#[tokio::test]
async fn test_transient_connect_failure_retried() {
    let db = MockDatabase::new();
    db.fail_next_connect(Error::PoolExhausted {
        message: "too many clients already".into(),
    });
    let repo = db.repository().with_retry_policy(fast(3));

    let affected = repo
        .execute("UPDATE t SET x = 1", &Params::new(), &CommandOptions::new())
        .await
        .unwrap();

    assert_eq!(affected, 1);
    assert_eq!(db.connections_opened(), 1);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let db = MockDatabase::new();
    let repo = db.repository();
    let token = CancellationToken::new();
    token.cancel();

    let err = repo
        .execute(
            "UPDATE t SET x = 1",
            &Params::new(),
            &CommandOptions::new().with_cancellation(token),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(db.connections_opened(), 0);
}

#[tokio::test]
async fn test_cancel_during_backoff() {
    let db = MockDatabase::new();
    for _ in 0..4 {
        db.fail_next(Error::connection("reset"));
    }
    let slow = RetryPolicy::from_settings(&RetrySettings {
        max_retries: 3,
        base_delay_ms: 10_000,
        max_delay_ms: 10_000,
        ..RetrySettings::default()
    });
    let repo = db.repository().with_retry_policy(slow);
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = repo
        .execute(
            "UPDATE t SET x = 1",
            &Params::new(),
            &CommandOptions::new().with_cancellation(token),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(db.statements().len(), 1);
}
