//! Tests for lazy record streams

use dynrepo::command::CommandOptions;
use dynrepo::error::{Error, ErrorCategory, Result};
use dynrepo::materialize::{FromRow, RecordStream, RowMapper};
use dynrepo::params::Params;
use dynrepo::testing::MockDatabase;
use dynrepo::types::{Row, Value};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Reading {
    id: i64,
}

impl FromRow for Reading {
    fn from_row(row: &Row) -> Result<Self> {
        RowMapper::<Reading>::new()
            .column("Id", |r, v| r.id = v)
            .map(row)
    }
}

fn readings(n: i64) -> Vec<Row> {
    (1..=n)
        .map(|id| Row::from_pairs([("id", Value::Int64(id))]))
        .collect()
}

#[tokio::test]
async fn test_stream_exhausts_and_releases() {
    let db = MockDatabase::new().with_rows(readings(5));
    let repo = db.repository();

    let stream: RecordStream<Reading> = repo
        .query_stream("SELECT id FROM readings", &Params::new(), &CommandOptions::new())
        .await
        .unwrap();
    // nothing is pulled until the caller asks
    assert_eq!(db.rows_streamed(), 0);

    let ids: Vec<i64> = stream.map(|r| r.unwrap().id).collect().await;
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(db.connections_opened(), 1);
    assert_eq!(db.connections_closed(), 1);
}

#[tokio::test]
async fn test_stream_cancel_releases_and_ends() {
    let db = MockDatabase::new().with_rows(readings(100));
    let repo = db.repository();
    let token = CancellationToken::new();

    let mut stream: RecordStream<Reading> = repo
        .query_stream(
            "SELECT id FROM readings",
            &Params::new(),
            &CommandOptions::new().with_cancellation(token.clone()),
        )
        .await
        .unwrap();

    for expected in 1..=3 {
        let reading = stream.next().await.unwrap().unwrap();
        assert_eq!(reading.id, expected);
    }
    token.cancel();

    let next = stream.next().await.unwrap();
    assert!(matches!(next, Err(Error::Cancelled)));
    assert!(stream.next().await.is_none());

    assert_eq!(db.rows_streamed(), 3);
    assert_eq!(db.connections_closed(), db.connections_opened());
}

#[tokio::test]
async fn test_stream_dropped_early_closes_connection() {
    let db = MockDatabase::new().with_rows(readings(100));
    let repo = db.repository();

    let mut stream: RecordStream<Reading> = repo
        .query_stream("SELECT id FROM readings", &Params::new(), &CommandOptions::new())
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap().id, 1);
    drop(stream);

    // the close runs on a spawned task
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(db.rows_streamed(), 1);
    assert_eq!(db.connections_opened(), 1);
    assert_eq!(db.connections_closed(), 1);
}

#[tokio::test]
async fn test_stream_mapping_error_ends_stream() {
    let mut rows = readings(2);
    rows.push(Row::from_pairs([("id", Value::Bytes(vec![0xff]))]));
    rows.extend(readings(2));
    let db = MockDatabase::new().with_rows(rows);
    let repo = db.repository();

    let results: Vec<Result<Reading>> = repo
        .query_stream("SELECT id FROM readings", &Params::new(), &CommandOptions::new())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    assert_eq!(
        results[2].as_ref().unwrap_err().category(),
        ErrorCategory::TypeConversion
    );
    assert_eq!(db.connections_closed(), 1);
}

#[tokio::test]
async fn test_stream_open_is_retried() {
    let db = MockDatabase::new().with_rows(readings(2));
    db.fail_next(Error::connection("connection reset by peer"));
    let repo = db.repository();

    let stream: RecordStream<Row> = repo
        .query_stream("SELECT id FROM readings", &Params::new(), &CommandOptions::new())
        .await
        .unwrap();
    assert_eq!(stream.count().await, 2);

    // the failed attempt's connection was released before the retry
    assert_eq!(db.connections_opened(), 2);
    assert_eq!(db.connections_closed(), 2);
}

#[tokio::test]
async fn test_stream_rejected_before_open_when_cancelled() {
    let db = MockDatabase::new().with_rows(readings(2));
    let token = CancellationToken::new();
    token.cancel();

    let err = db
        .repository()
        .query_stream::<Row>(
            "SELECT id FROM readings",
            &Params::new(),
            &CommandOptions::new().with_cancellation(token),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(db.connections_opened(), 0);
}
