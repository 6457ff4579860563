//! Testing utilities for repositories
//!
//! A scripted, in-memory backend implementing the connection traits. Tests
//! program the rows a statement returns, inject failures, and inspect what
//! was executed and how connections and transactions were handled.
//!
//! # Example
//!
//! ```rust,ignore
//! use dynrepo::testing::MockDatabase;
//!
//! let db = MockDatabase::new().with_table(orders);
//! let repo = db.repository();
//!
//! let page = repo.get_paged::<Row>("SELECT * FROM Orders", &Params::new(), &PageRequest::new(2, 10), &CommandOptions::new()).await?;
//! assert_eq!(page.total_count, 25);
//! assert_eq!(db.connections_closed(), db.connections_opened());
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use crate::config::{RepositoryConfig, RetrySettings};
use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, Executor, RowStream,
    Transaction,
};
use crate::error::{Error, Result};
use crate::repository::Repository;
use crate::retry::RetryPolicy;
use crate::types::{Row, Value};

/// Produces rows for a statement
pub type QueryHandler = Arc<dyn Fn(&str, &[Value]) -> Result<Vec<Row>> + Send + Sync>;

/// Produces the affected-row count for a statement
pub type ExecuteHandler = Arc<dyn Fn(&str, &[Value]) -> Result<u64> + Send + Sync>;

/// A statement seen by the mock backend
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStatement {
    /// SQL with positional placeholders
    pub sql: String,
    /// Bound values
    pub params: Vec<Value>,
    /// Whether it ran inside a transaction
    pub in_transaction: bool,
}

struct MockState {
    database_type: DatabaseType,
    query_handler: Mutex<QueryHandler>,
    execute_handler: Mutex<ExecuteHandler>,
    failures: Mutex<VecDeque<Error>>,
    connect_failures: Mutex<VecDeque<Error>>,
    statements: Mutex<Vec<RecordedStatement>>,
    copied: Mutex<Vec<Vec<Value>>>,
    connections_opened: AtomicUsize,
    connections_closed: AtomicUsize,
    transactions_begun: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    rows_streamed: AtomicUsize,
    copy_batches: AtomicUsize,
}

impl MockState {
    fn record(&self, sql: &str, params: &[Value], in_transaction: bool) -> Result<()> {
        self.statements.lock().push(RecordedStatement {
            sql: sql.to_string(),
            params: params.to_vec(),
            in_transaction,
        });
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn query(&self, sql: &str, params: &[Value], in_transaction: bool) -> Result<Vec<Row>> {
        self.record(sql, params, in_transaction)?;
        let handler = Arc::clone(&self.query_handler.lock());
        handler(sql, params)
    }

    fn execute(&self, sql: &str, params: &[Value], in_transaction: bool) -> Result<u64> {
        self.record(sql, params, in_transaction)?;
        let handler = Arc::clone(&self.execute_handler.lock());
        handler(sql, params)
    }

    fn stream(
        self: &Arc<Self>,
        sql: &str,
        params: &[Value],
        in_transaction: bool,
    ) -> Result<RowStream> {
        let rows = self.query(sql, params, in_transaction)?;
        let state = Arc::clone(self);
        Ok(stream::iter(rows)
            .map(move |row| {
                state.rows_streamed.fetch_add(1, Ordering::SeqCst);
                Ok(row)
            })
            .boxed())
    }

    fn copy(&self, sql: &str, in_transaction: bool) -> Result<()> {
        self.record(sql, &[], in_transaction)?;
        self.copy_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn no_rows(_sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
    Ok(Vec::new())
}

fn one_affected(_sql: &str, _params: &[Value]) -> Result<u64> {
    Ok(1)
}

/// Handle to a scripted database shared by its connections
#[derive(Clone)]
pub struct MockDatabase {
    state: Arc<MockState>,
}

impl std::fmt::Debug for MockDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDatabase")
            .field("database_type", &self.state.database_type)
            .field("statements", &self.state.statements.lock().len())
            .field("connections_opened", &self.connections_opened())
            .finish()
    }
}

impl Default for MockDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDatabase {
    /// PostgreSQL-flavored database returning no rows and one affected row
    pub fn new() -> Self {
        Self::with_database_type(DatabaseType::PostgreSQL)
    }

    /// Database reporting the given type (and therefore dialect)
    pub fn with_database_type(database_type: DatabaseType) -> Self {
        Self {
            state: Arc::new(MockState {
                database_type,
                query_handler: Mutex::new(Arc::new(no_rows) as QueryHandler),
                execute_handler: Mutex::new(Arc::new(one_affected) as ExecuteHandler),
                failures: Mutex::new(VecDeque::new()),
                connect_failures: Mutex::new(VecDeque::new()),
                statements: Mutex::new(Vec::new()),
                copied: Mutex::new(Vec::new()),
                connections_opened: AtomicUsize::new(0),
                connections_closed: AtomicUsize::new(0),
                transactions_begun: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
                rows_streamed: AtomicUsize::new(0),
                copy_batches: AtomicUsize::new(0),
            }),
        }
    }

    /// Answer every query with `rows`
    pub fn with_rows(self, rows: Vec<Row>) -> Self {
        self.with_handler(move |_, _| Ok(rows.clone()))
    }

    /// Answer queries through `handler`
    pub fn with_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Result<Vec<Row>> + Send + Sync + 'static,
    {
        *self.state.query_handler.lock() = Arc::new(handler) as QueryHandler;
        self
    }

    /// Answer non-queries through `handler`
    pub fn with_execute_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Result<u64> + Send + Sync + 'static,
    {
        *self.state.execute_handler.lock() = Arc::new(handler) as ExecuteHandler;
        self
    }

    /// Serve `rows` as one table: `COUNT(*)` statements get the row count,
    /// windowed statements get the slice selected by their last two
    /// parameters (limit, offset), everything else gets all rows.
    pub fn with_table(self, rows: Vec<Row>) -> Self {
        self.with_handler(move |sql, params| {
            if sql.contains("COUNT(*)") {
                return Ok(vec![Row::from_pairs([(
                    "count",
                    Value::Int64(rows.len() as i64),
                )])]);
            }
            if sql.contains(" LIMIT ") && params.len() >= 2 {
                let limit = params[params.len() - 2].as_i64().unwrap_or(0).max(0) as usize;
                let offset = params[params.len() - 1].as_i64().unwrap_or(0).max(0) as usize;
                return Ok(rows.iter().skip(offset).take(limit).cloned().collect());
            }
            Ok(rows.clone())
        })
    }

    /// Fail the next statement with `error`; calls queue up
    pub fn fail_next(&self, error: Error) {
        self.state.failures.lock().push_back(error);
    }

    /// Fail the next connection attempt with `error`
    pub fn fail_next_connect(&self, error: Error) {
        self.state.connect_failures.lock().push_back(error);
    }

    /// Factory opening connections to this database
    pub fn factory(&self) -> MockConnectionFactory {
        MockConnectionFactory {
            state: Arc::clone(&self.state),
        }
    }

    /// Open a connection directly (counts as opened)
    pub fn connection(&self) -> MockConnection {
        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        MockConnection::new(Arc::clone(&self.state))
    }

    /// Repository with default config and a fast retry policy
    pub fn repository(&self) -> Repository {
        let policy = RetryPolicy::from_settings(&RetrySettings {
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..RetrySettings::default()
        });
        self.repository_with(&RepositoryConfig::default())
            .with_retry_policy(policy)
    }

    /// Repository with the given config
    pub fn repository_with(&self, config: &RepositoryConfig) -> Repository {
        Repository::new(
            Arc::new(self.factory()),
            ConnectionConfig::new("mock://localhost/test"),
            config,
        )
    }

    /// Every statement seen so far
    pub fn statements(&self) -> Vec<RecordedStatement> {
        self.state.statements.lock().clone()
    }

    /// SQL of every statement seen so far
    pub fn executed_sql(&self) -> Vec<String> {
        self.state
            .statements
            .lock()
            .iter()
            .map(|s| s.sql.clone())
            .collect()
    }

    /// Rows that reached the table through committed or direct copies
    pub fn copied_rows(&self) -> Vec<Vec<Value>> {
        self.state.copied.lock().clone()
    }

    /// Copy batches received (committed or not)
    pub fn copy_batches(&self) -> usize {
        self.state.copy_batches.load(Ordering::SeqCst)
    }

    /// Connections opened
    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    /// Connections closed
    pub fn connections_closed(&self) -> usize {
        self.state.connections_closed.load(Ordering::SeqCst)
    }

    /// Transactions begun
    pub fn transactions_begun(&self) -> usize {
        self.state.transactions_begun.load(Ordering::SeqCst)
    }

    /// Transactions committed
    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }

    /// Transactions rolled back
    pub fn rollbacks(&self) -> usize {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    /// Rows pulled from streams so far
    pub fn rows_streamed(&self) -> usize {
        self.state.rows_streamed.load(Ordering::SeqCst)
    }
}

/// Factory handing out [`MockConnection`]s
#[derive(Clone)]
pub struct MockConnectionFactory {
    state: Arc<MockState>,
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        if let Some(error) = self.state.connect_failures.lock().pop_front() {
            return Err(error);
        }
        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection::new(Arc::clone(&self.state))))
    }

    fn database_type(&self) -> DatabaseType {
        self.state.database_type
    }
}

/// Connection to a [`MockDatabase`]
pub struct MockConnection {
    state: Arc<MockState>,
    closed: AtomicBool,
}

impl MockConnection {
    fn new(state: Arc<MockState>) -> Self {
        Self {
            state,
            closed: AtomicBool::new(false),
        }
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for MockConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        self.state.query(sql, params, false)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        self.state.execute(sql, params, false)
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<RowStream> {
        self.ensure_open()?;
        self.state.stream(sql, params, false)
    }

    async fn copy_in(&self, sql: &str, rows: &[Vec<Value>]) -> Result<u64> {
        self.ensure_open()?;
        self.state.copy(sql, false)?;
        self.state.copied.lock().extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn as_executor(&self) -> &dyn Executor {
        self
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        self.state.transactions_begun.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransaction {
            state: Arc::clone(&self.state),
            completed: AtomicBool::new(false),
            pending_copies: Mutex::new(Vec::new()),
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.connections_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Transaction on a [`MockConnection`]; copied rows become visible on commit
pub struct MockTransaction {
    state: Arc<MockState>,
    completed: AtomicBool,
    pending_copies: Mutex<Vec<Vec<Value>>>,
}

impl MockTransaction {
    fn complete(&self) -> Result<()> {
        if self.completed.swap(true, Ordering::SeqCst) {
            return Err(Error::transaction("transaction already completed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for MockTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.state.query(sql, params, true)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.state.execute(sql, params, true)
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<RowStream> {
        self.state.stream(sql, params, true)
    }

    async fn copy_in(&self, sql: &str, rows: &[Vec<Value>]) -> Result<u64> {
        self.state.copy(sql, true)?;
        self.pending_copies.lock().extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }
}

#[async_trait]
impl Transaction for MockTransaction {
    fn as_executor(&self) -> &dyn Executor {
        self
    }

    async fn commit(&self) -> Result<()> {
        self.complete()?;
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        let pending = std::mem::take(&mut *self.pending_copies.lock());
        self.state.copied.lock().extend(pending);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.complete()?;
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.pending_copies.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failure_injection_and_log() {
        let db = MockDatabase::new().with_rows(vec![Row::from_pairs([("n", 1)])]);
        db.fail_next(Error::deadlock("40P01"));
        let conn = db.connection();

        assert!(conn.query("SELECT 1", &[]).await.is_err());
        assert_eq!(conn.query("SELECT 1", &[]).await.unwrap().len(), 1);
        assert_eq!(db.executed_sql(), vec!["SELECT 1", "SELECT 1"]);
    }

    #[tokio::test]
    async fn test_transaction_copies_visible_on_commit() {
        let db = MockDatabase::new();
        let conn = db.connection();

        let tx = conn.begin().await.unwrap();
        tx.copy_in("COPY t (a) FROM STDIN", &[vec![Value::Int32(1)]])
            .await
            .unwrap();
        assert!(db.copied_rows().is_empty());
        tx.commit().await.unwrap();
        assert_eq!(db.copied_rows().len(), 1);
        assert!(tx.rollback().await.is_err());

        let tx = conn.begin().await.unwrap();
        tx.copy_in("COPY t (a) FROM STDIN", &[vec![Value::Int32(2)]])
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(db.copied_rows().len(), 1);
        assert_eq!(db.commits(), 1);
        assert_eq!(db.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_close_counts_once() {
        let db = MockDatabase::new();
        let conn = db.connection();
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(db.connections_closed(), 1);
        assert!(conn.query("SELECT 1", &[]).await.is_err());
    }
}
