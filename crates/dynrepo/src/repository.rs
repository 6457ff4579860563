//! Repository facade
//!
//! Every public operation runs under the retry engine. Each attempt leases a
//! connection (owned, or borrowed from an injected unit of work), issues its
//! bound statements, releases the lease and hands rows to the materializer.
//! Failures are logged with operation name, SQL shape and category before
//! they are returned.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::bulk::{BulkLoader, BulkOptions, BulkPayload};
use crate::command::{sql_shape, Command, CommandKind, CommandOptions};
use crate::compose::{QueryComposer, RoutineCall};
use crate::config::{ConfigConnectionStrings, ConnectionStringResolver, RepositoryConfig};
use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, Executor, Transaction,
};
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::filter::{FilterRequest, PageRequest, PagedResult};
use crate::lifecycle::{ConnectionLease, ConnectionLifecycleManager, LifecycleState};
use crate::materialize::{self, FromRow, FromValue, RecordStream, ResultSets};
use crate::params::{split_statements, BoundStatement, ParameterBinder, Params};
use crate::retry::{RetryPolicy, RetryPolicyEngine};
use crate::strategy::ParameterStrategyResolver;
use crate::types::Row;

/// Outcome of one attempt, handing the lease back for release
type Attempt<T> = (ConnectionLease, Result<T>);

/// Data-access facade over one logical database
pub struct Repository {
    lifecycle: ConnectionLifecycleManager,
    dialect: Arc<dyn SqlDialect>,
    composer: QueryComposer,
    strategies: ParameterStrategyResolver,
    retry: RetryPolicyEngine,
    command_timeout: Duration,
    max_page_size: u32,
    total_count_column: String,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("dialect", &self.dialect.name())
            .field("lifecycle", &self.lifecycle)
            .field("retry", self.retry.policy())
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl Repository {
    /// Create a facade. The dialect follows the factory's database type.
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        connection: ConnectionConfig,
        config: &RepositoryConfig,
    ) -> Self {
        let dialect: Arc<dyn SqlDialect> = Arc::from(factory.database_type().dialect());
        let naming = config
            .parameters
            .naming
            .unwrap_or_else(|| dialect.parameter_naming());
        let strategies = ParameterStrategyResolver::new(naming)
            .with_defaults(
                config.parameters.text_strategy,
                config.parameters.procedure_strategy,
            )
            .with_blob_name(config.parameters.filter_blob_name.clone());

        Self {
            lifecycle: ConnectionLifecycleManager::new(factory, connection),
            composer: QueryComposer::new(Arc::clone(&dialect)),
            dialect,
            strategies,
            retry: RetryPolicyEngine::new(RetryPolicy::from_settings(&config.retry)),
            command_timeout: config.command_timeout(),
            max_page_size: config.pagination.max_page_size,
            total_count_column: config.parameters.total_count_column.clone(),
        }
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryPolicyEngine::new(policy);
        self
    }

    /// SQL dialect in use
    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// Retry policy in use
    pub fn retry_policy(&self) -> &RetryPolicy {
        self.retry.policy()
    }

    // ========================================================================
    // Unit of Work handoff
    // ========================================================================

    /// Use an externally owned connection; it is never closed here
    pub fn set_connection(&mut self, connection: Arc<dyn Connection>) {
        self.lifecycle.set_connection(connection);
    }

    /// Enlist every command in an externally owned transaction
    pub fn set_transaction(&mut self, transaction: Arc<dyn Transaction>) {
        self.lifecycle.set_transaction(transaction);
    }

    /// Drop injected connection and transaction; idempotent
    pub fn clear_transaction(&mut self) {
        self.lifecycle.clear_transaction();
    }

    /// Current handoff state
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run a query and map every row
    pub async fn query<T: FromRow>(
        &self,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<Vec<T>> {
        let result = self.query_rows("query", sql, params, options).await;
        self.observe("query", sql, result.and_then(|rows| materialize::map_rows(&rows)))
    }

    /// Same as [`query`](Self::query)
    pub async fn query_list<T: FromRow>(
        &self,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<Vec<T>> {
        let result = self.query_rows("query_list", sql, params, options).await;
        self.observe(
            "query_list",
            sql,
            result.and_then(|rows| materialize::map_rows(&rows)),
        )
    }

    /// Run a routine and map every row
    pub async fn query_procedure<T: FromRow>(
        &self,
        routine: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<Vec<T>> {
        let options = procedure_options(options);
        let result = self
            .query_rows("query_procedure", routine, params, &options)
            .await;
        self.observe(
            "query_procedure",
            routine,
            result.and_then(|rows| materialize::map_rows(&rows)),
        )
    }

    /// First column of the first row; `T::default()` for no rows or NULL
    pub async fn scalar<T: FromValue + Default>(
        &self,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<T> {
        let result = self.query_rows("scalar", sql, params, options).await;
        self.observe("scalar", sql, result.and_then(|rows| materialize::scalar(&rows)))
    }

    /// Run a counting statement; overflow of `i32` is a conversion error
    pub async fn count(&self, sql: &str, params: &Params, options: &CommandOptions) -> Result<i32> {
        let result = self.count_rows("count", sql, params, options).await.and_then(|n| {
            i32::try_from(n)
                .map_err(|_| Error::type_conversion(format!("count {} does not fit in i32", n)))
        });
        self.observe("count", sql, result)
    }

    /// Run a counting statement as `i64`
    pub async fn long_count(
        &self,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<i64> {
        let result = self.count_rows("long_count", sql, params, options).await;
        self.observe("long_count", sql, result)
    }

    /// Whether a counting statement returns more than zero
    pub async fn exists(&self, sql: &str, params: &Params, options: &CommandOptions) -> Result<bool> {
        let result = self.count_rows("exists", sql, params, options).await;
        self.observe("exists", sql, result.map(|n| n > 0))
    }

    /// First row, if any. Reading stops after the first row and the rest of
    /// the stream is dropped.
    pub async fn first_or_default<T: FromRow>(
        &self,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<Option<T>> {
        let result = self.leading_rows("first_or_default", sql, params, options, 1).await;
        self.observe(
            "first_or_default",
            sql,
            result.and_then(|rows| materialize::first(&rows)),
        )
    }

    /// The only row, if any; more than one row is [`Error::MultipleRows`]
    pub async fn single_or_default<T: FromRow>(
        &self,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<Option<T>> {
        let result = self.leading_rows("single_or_default", sql, params, options, 2).await;
        self.observe(
            "single_or_default",
            sql,
            result.and_then(|rows| materialize::single(&rows, &sql_shape(sql))),
        )
    }

    /// Run every statement in `sql` on one connection and keep each result set
    pub async fn query_multiple(
        &self,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<ResultSets> {
        let result = self.query_multiple_inner(sql, params, options).await;
        self.observe("query_multiple", sql, result)
    }

    /// Open a lazy record stream.
    ///
    /// Retries cover opening the stream only; the lease is held by the
    /// stream until it ends, fails, is cancelled or dropped.
    pub async fn query_stream<T: FromRow + Send + 'static>(
        &self,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<RecordStream<T>> {
        let result = self.query_stream_inner(sql, params, options).await;
        self.observe("query_stream", sql, result)
    }

    // ========================================================================
    // Pagination and filtering
    // ========================================================================

    /// One page of `sql` plus the total from a derived `COUNT(*)` query
    pub async fn get_paged<T: FromRow>(
        &self,
        sql: &str,
        params: &Params,
        page: &PageRequest,
        options: &CommandOptions,
    ) -> Result<PagedResult<T>> {
        let result = self.paged_inner(sql, None, params, page, options).await;
        self.observe("get_paged", sql, result)
    }

    /// One page of `sql` with the total from the caller's counting statement
    pub async fn get_paged_with_count<T: FromRow>(
        &self,
        sql: &str,
        count_sql: &str,
        params: &Params,
        page: &PageRequest,
        options: &CommandOptions,
    ) -> Result<PagedResult<T>> {
        let result = self
            .paged_inner(sql, Some(count_sql), params, page, options)
            .await;
        self.observe("get_paged_with_count", sql, result)
    }

    /// One page from a paging routine; the total comes from the configured
    /// count column of the first row (zero when no rows come back)
    pub async fn get_paged_from_procedure<T: FromRow>(
        &self,
        routine: &str,
        params: &Params,
        page: &PageRequest,
        options: &CommandOptions,
    ) -> Result<PagedResult<T>> {
        let result = self.paged_procedure_inner(routine, params, page, options).await;
        self.observe("get_paged_from_procedure", routine, result)
    }

    /// Every row of `sql` matching the filter, ordered by the requested sort
    pub async fn get_filtered<T: FromRow>(
        &self,
        sql: &str,
        params: &Params,
        filter: &FilterRequest,
        options: &CommandOptions,
    ) -> Result<Vec<T>> {
        let result = self.filtered_inner(sql, params, filter, options).await;
        self.observe("get_filtered", sql, result)
    }

    /// Every row a filtering routine returns
    pub async fn get_filtered_from_procedure<T: FromRow>(
        &self,
        routine: &str,
        params: &Params,
        filter: &FilterRequest,
        options: &CommandOptions,
    ) -> Result<Vec<T>> {
        let result = self
            .filtered_procedure_inner(routine, params, filter, options)
            .await;
        self.observe("get_filtered_from_procedure", routine, result)
    }

    // ========================================================================
    // Commands and loading
    // ========================================================================

    /// Run a non-query, returns affected rows
    pub async fn execute(&self, sql: &str, params: &Params, options: &CommandOptions) -> Result<u64> {
        let result = self.execute_inner("execute", sql, params, options).await;
        self.observe("execute", sql, result)
    }

    /// Invoke a routine for its side effects, returns affected rows
    pub async fn execute_procedure(
        &self,
        routine: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<u64> {
        let options = procedure_options(options);
        let result = self
            .execute_inner("execute_procedure", routine, params, &options)
            .await;
        self.observe("execute_procedure", routine, result)
    }

    /// Run statements in order, returns total affected rows.
    ///
    /// Without an ambient transaction each attempt runs in its own
    /// transaction, committed on success and rolled back on failure.
    pub async fn execute_batch(
        &self,
        statements: &[(&str, Params)],
        options: &CommandOptions,
    ) -> Result<u64> {
        let shape = statements.first().map_or("", |(sql, _)| *sql);
        let result = self.execute_batch_inner(statements, options).await;
        self.observe("execute_batch", shape, result)
    }

    /// Load `payload` through the bulk-copy protocol, returns rows written.
    ///
    /// An empty payload returns zero without touching the database.
    pub async fn bulk_insert(
        &self,
        payload: &BulkPayload,
        bulk: &BulkOptions,
        options: &CommandOptions,
    ) -> Result<u64> {
        let result = self.bulk_insert_inner(payload, bulk, options).await;
        self.observe("bulk_insert", &bulk.table, result)
    }

    // ========================================================================
    // Attempt plumbing
    // ========================================================================

    fn timeout(&self, options: &CommandOptions) -> Duration {
        options.timeout.unwrap_or(self.command_timeout)
    }

    /// Retries are off inside an ambient transaction
    fn retry_budget(&self) -> Option<u32> {
        self.lifecycle.has_ambient_transaction().then_some(0)
    }

    fn binder(&self) -> ParameterBinder<'_> {
        ParameterBinder::new(self.dialect.as_ref())
    }

    /// Bind `sql` (or a routine call when the options say so)
    fn statement(
        &self,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
        call: RoutineCall,
    ) -> Result<BoundStatement> {
        match options.kind {
            CommandKind::Text => {
                Command::new(sql, options.kind, self.timeout(options), params.clone())
                    .bind(self.dialect.as_ref())
            }
            CommandKind::StoredProcedure => self.composer.procedure_statement(sql, params, call),
        }
    }

    /// Run `work` under the retry policy with a fresh lease per attempt
    async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        options: &CommandOptions,
        timeout: Duration,
        work: F,
    ) -> Result<T>
    where
        F: Fn(ConnectionLease) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let work = &work;
        let cancellation = &options.cancellation;
        self.retry
            .execute(operation, cancellation, self.retry_budget(), move |attempt| async move {
                let lease = self.lifecycle.acquire().await?;
                debug!(operation, attempt, ownership = ?lease.ownership(), "Attempt started");

                let outcome = tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => return Err(Error::Cancelled),
                    outcome = tokio::time::timeout(timeout, work(lease)) => outcome,
                };
                let (lease, result) = outcome.map_err(|_| {
                    Error::timeout(format!("{} did not complete within {:?}", operation, timeout))
                })?;

                if let Err(e) = lease.release().await {
                    warn!(operation, error = %e, "Failed to release connection");
                }
                result
            })
            .await
    }

    fn observe<T>(&self, operation: &'static str, sql: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            error!(
                operation,
                sql = %sql_shape(sql),
                category = %e.category(),
                layer = %e.layer(),
                error = %e,
                "Repository operation failed"
            );
        }
        result
    }

    // ========================================================================
    // Operation bodies
    // ========================================================================

    async fn query_rows(
        &self,
        operation: &'static str,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<Vec<Row>> {
        let bound = self.statement(sql, params, options, RoutineCall::Query)?;
        let bound = &bound;
        self.run(operation, options, self.timeout(options), |lease| async move {
            let rows = lease.executor().query(&bound.sql, &bound.values).await;
            (lease, rows)
        })
        .await
    }

    async fn count_rows(
        &self,
        operation: &'static str,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<i64> {
        let rows = self.query_rows(operation, sql, params, options).await?;
        materialize::scalar::<i64>(&rows)
    }

    /// At most `limit` rows. Consumption stops at `limit` and the stream is
    /// dropped; rows the server already sent are discarded.
    async fn leading_rows(
        &self,
        operation: &'static str,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let bound = self.statement(sql, params, options, RoutineCall::Query)?;
        let bound = &bound;
        self.run(operation, options, self.timeout(options), |lease| async move {
            let result: Result<Vec<Row>> = async {
                let stream = lease.executor().query_stream(&bound.sql, &bound.values).await?;
                stream.take(limit).collect::<Vec<_>>().await.into_iter().collect()
            }
            .await;
            (lease, result)
        })
        .await
    }

    async fn query_multiple_inner(
        &self,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<ResultSets> {
        let statements = split_statements(sql)
            .iter()
            .map(|statement| self.binder().bind(statement, params))
            .collect::<Result<Vec<_>>>()?;
        if statements.is_empty() {
            return Err(Error::validation("SQL text is empty"));
        }

        let statements = &statements;
        let sets = self
            .run("query_multiple", options, self.timeout(options), |lease| async move {
                let result: Result<Vec<Vec<Row>>> = async {
                    let mut sets = Vec::with_capacity(statements.len());
                    for statement in statements {
                        sets.push(
                            lease
                                .executor()
                                .query(&statement.sql, &statement.values)
                                .await?,
                        );
                    }
                    Ok(sets)
                }
                .await;
                (lease, result)
            })
            .await?;
        Ok(ResultSets::new(sets))
    }

    async fn query_stream_inner<T: FromRow + Send + 'static>(
        &self,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<RecordStream<T>> {
        let bound = self.statement(sql, params, options, RoutineCall::Query)?;
        let bound = &bound;
        let cancellation = &options.cancellation;
        let timeout = self.timeout(options);

        self.retry
            .execute("query_stream", cancellation, self.retry_budget(), move |_| async move {
                let lease = self.lifecycle.acquire().await?;
                let opened = tokio::time::timeout(
                    timeout,
                    lease.executor().query_stream(&bound.sql, &bound.values),
                )
                .await
                .unwrap_or_else(|_| Err(Error::timeout("opening the stream timed out")));

                match opened {
                    Ok(rows) => Ok(RecordStream::new(rows, lease, cancellation.clone())),
                    Err(e) => {
                        if let Err(release) = lease.release().await {
                            warn!(error = %release, "Failed to release connection");
                        }
                        Err(e)
                    }
                }
            })
            .await
    }

    async fn paged_inner<T: FromRow>(
        &self,
        sql: &str,
        count_sql: Option<&str>,
        params: &Params,
        page: &PageRequest,
        options: &CommandOptions,
    ) -> Result<PagedResult<T>> {
        page.validate(self.max_page_size)?;

        let strategy = self
            .strategies
            .resolve(CommandKind::Text, options.filter_strategy);
        let mut filter_params = self.strategies.text_params(&page.filter, strategy)?;
        filter_params.extend(params.clone());

        let paged_sql = self.composer.paged_sql(sql, page.filter.sort.as_ref())?;
        let count_sql = match count_sql {
            Some(count_sql) => self.composer.single_statement(count_sql)?,
            None => self.composer.count_sql(sql)?,
        };

        let mut page_params = filter_params.clone();
        page_params.extend(self.composer.page_params(page));
        let page_statement = self.binder().bind(&paged_sql, &page_params)?;
        let count_statement = self.binder().bind(&count_sql, &filter_params)?;

        let (page_statement, count_statement) = (&page_statement, &count_statement);
        let (rows, total) = self
            .run("get_paged", options, self.timeout(options), |lease| async move {
                let result: Result<(Vec<Row>, i64)> = async {
                    let counted = lease
                        .executor()
                        .query(&count_statement.sql, &count_statement.values)
                        .await?;
                    let total = materialize::scalar::<i64>(&counted)?;
                    let rows = lease
                        .executor()
                        .query(&page_statement.sql, &page_statement.values)
                        .await?;
                    Ok((rows, total))
                }
                .await;
                (lease, result)
            })
            .await?;

        let mut metadata = page.filter.metadata();
        if options.capture_table_name {
            if let Some(table) = self.composer.capture_table_name(sql) {
                debug!(table = %table, "Captured table name");
                metadata.insert("table".to_string(), serde_json::Value::String(table));
            }
        }

        let items = materialize::map_rows(&rows)?;
        Ok(PagedResult::new(items, page.page_index, page.page_size, total).with_metadata(metadata))
    }

    async fn paged_procedure_inner<T: FromRow>(
        &self,
        routine: &str,
        params: &Params,
        page: &PageRequest,
        options: &CommandOptions,
    ) -> Result<PagedResult<T>> {
        page.validate(self.max_page_size)?;

        let strategy = self
            .strategies
            .resolve(CommandKind::StoredProcedure, options.filter_strategy);
        let mut all = self.strategies.procedure_params(
            &page.filter,
            Some((page.page_index, page.page_size)),
            strategy,
        )?;
        all.extend(params.clone());

        let bound = self
            .composer
            .procedure_statement(routine, &all, RoutineCall::Query)?;
        let bound = &bound;
        let rows = self
            .run(
                "get_paged_from_procedure",
                options,
                self.timeout(options),
                |lease| async move {
                    let rows = lease.executor().query(&bound.sql, &bound.values).await;
                    (lease, rows)
                },
            )
            .await?;

        let total = match rows.first() {
            None => 0,
            Some(row) => match row.get_by_name(&self.total_count_column) {
                Some(value) => Option::<i64>::from_value(value)?.unwrap_or(0),
                None => {
                    return Err(Error::config(format!(
                        "paging routine {} returned no '{}' column",
                        routine, self.total_count_column
                    )))
                }
            },
        };

        let items = materialize::map_rows(&rows)?;
        Ok(PagedResult::new(items, page.page_index, page.page_size, total)
            .with_metadata(page.filter.metadata()))
    }

    async fn filtered_inner<T: FromRow>(
        &self,
        sql: &str,
        params: &Params,
        filter: &FilterRequest,
        options: &CommandOptions,
    ) -> Result<Vec<T>> {
        let strategy = self
            .strategies
            .resolve(CommandKind::Text, options.filter_strategy);
        let mut all = self.strategies.text_params(filter, strategy)?;
        all.extend(params.clone());

        let sql = self.composer.filtered_sql(sql, filter.sort.as_ref())?;
        let bound = self.binder().bind(&sql, &all)?;
        let bound = &bound;
        let rows = self
            .run("get_filtered", options, self.timeout(options), |lease| async move {
                let rows = lease.executor().query(&bound.sql, &bound.values).await;
                (lease, rows)
            })
            .await?;
        materialize::map_rows(&rows)
    }

    async fn filtered_procedure_inner<T: FromRow>(
        &self,
        routine: &str,
        params: &Params,
        filter: &FilterRequest,
        options: &CommandOptions,
    ) -> Result<Vec<T>> {
        let strategy = self
            .strategies
            .resolve(CommandKind::StoredProcedure, options.filter_strategy);
        let mut all = self.strategies.procedure_params(filter, None, strategy)?;
        all.extend(params.clone());

        let bound = self
            .composer
            .procedure_statement(routine, &all, RoutineCall::Query)?;
        let bound = &bound;
        let rows = self
            .run(
                "get_filtered_from_procedure",
                options,
                self.timeout(options),
                |lease| async move {
                    let rows = lease.executor().query(&bound.sql, &bound.values).await;
                    (lease, rows)
                },
            )
            .await?;
        materialize::map_rows(&rows)
    }

    async fn execute_inner(
        &self,
        operation: &'static str,
        sql: &str,
        params: &Params,
        options: &CommandOptions,
    ) -> Result<u64> {
        let bound = self.statement(sql, params, options, RoutineCall::Execute)?;
        let bound = &bound;
        self.run(operation, options, self.timeout(options), |lease| async move {
            let affected = lease.executor().execute(&bound.sql, &bound.values).await;
            (lease, affected)
        })
        .await
    }

    async fn execute_batch_inner(
        &self,
        statements: &[(&str, Params)],
        options: &CommandOptions,
    ) -> Result<u64> {
        if statements.is_empty() {
            return Ok(0);
        }
        let bound = statements
            .iter()
            .map(|(sql, params)| self.binder().bind(sql, params))
            .collect::<Result<Vec<_>>>()?;

        let bound = &bound;
        self.run("execute_batch", options, self.timeout(options), |lease| async move {
            let result = if lease.in_transaction() {
                execute_all(lease.executor(), bound).await
            } else {
                match lease.begin().await {
                    Ok(transaction) => {
                        let outcome = execute_all(transaction.as_executor(), bound).await;
                        settle(transaction.as_ref(), outcome).await
                    }
                    Err(e) => Err(e),
                }
            };
            (lease, result)
        })
        .await
    }

    async fn bulk_insert_inner(
        &self,
        payload: &BulkPayload,
        bulk: &BulkOptions,
        options: &CommandOptions,
    ) -> Result<u64> {
        if payload.is_empty() {
            debug!(table = %bulk.table, "Empty bulk payload, nothing to load");
            return Ok(0);
        }

        let loader = BulkLoader::new(self.dialect.as_ref());
        loader.copy_sql(payload, bulk)?;
        let timeout = bulk.timeout.unwrap_or_else(|| self.timeout(options));

        let written = self
            .run("bulk_insert", options, timeout, |lease| async move {
                let result = if lease.in_transaction() {
                    loader.load(lease.executor(), payload, bulk).await
                } else {
                    match lease.begin().await {
                        Ok(transaction) => {
                            let outcome =
                                loader.load(transaction.as_executor(), payload, bulk).await;
                            settle(transaction.as_ref(), outcome).await
                        }
                        Err(e) => Err(e),
                    }
                };
                (lease, result)
            })
            .await?;

        debug!(table = %bulk.table, rows = written, "Bulk load complete");
        Ok(written)
    }
}

fn procedure_options(options: &CommandOptions) -> CommandOptions {
    CommandOptions {
        kind: CommandKind::StoredProcedure,
        ..options.clone()
    }
}

async fn execute_all(executor: &dyn Executor, statements: &[BoundStatement]) -> Result<u64> {
    let mut affected = 0;
    for statement in statements {
        affected += executor.execute(&statement.sql, &statement.values).await?;
    }
    Ok(affected)
}

/// Commit an owned transaction on success, roll it back on failure
async fn settle<T>(transaction: &dyn Transaction, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            transaction.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = transaction.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

/// Creates repositories by logical connection name
pub struct RepositoryFactory {
    factory: Arc<dyn ConnectionFactory>,
    resolver: Arc<dyn ConnectionStringResolver>,
    config: RepositoryConfig,
    retry_policy: RetryPolicy,
    connection_strings: RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for RepositoryFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryFactory")
            .field("database_type", &self.factory.database_type())
            .field("cached", &self.connection_strings.read().len())
            .finish()
    }
}

impl RepositoryFactory {
    /// Create a factory with an explicit resolver
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        resolver: Arc<dyn ConnectionStringResolver>,
        config: RepositoryConfig,
    ) -> Self {
        let retry_policy = RetryPolicy::from_settings(&config.retry);
        Self {
            factory,
            resolver,
            config,
            retry_policy,
            connection_strings: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve connection strings from the config's own section
    pub fn from_config(factory: Arc<dyn ConnectionFactory>, config: RepositoryConfig) -> Self {
        let resolver = Arc::new(ConfigConnectionStrings::from_config(&config));
        Self::new(factory, resolver, config)
    }

    /// Replace the retry policy handed to new repositories
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Connection string for `name`, resolved once and cached
    pub fn connection_string(&self, name: &str) -> Result<String> {
        if let Some(url) = self.connection_strings.read().get(name) {
            return Ok(url.clone());
        }
        let url = self.resolver.resolve(name)?;
        self.connection_strings
            .write()
            .insert(name.to_string(), url.clone());
        Ok(url)
    }

    /// Repository for the database called `name`
    pub fn create(&self, name: &str) -> Result<Repository> {
        let url = self.connection_string(name)?;
        let mut connection =
            ConnectionConfig::new(url).with_connect_timeout(self.config.command.connect_timeout_ms);
        if let Some(app) = &self.config.command.application_name {
            connection = connection.with_application_name(app.clone());
        }

        debug!(name, url = %connection.redacted_url(), "Creating repository");
        Ok(
            Repository::new(Arc::clone(&self.factory), connection, &self.config)
                .with_retry_policy(self.retry_policy.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDatabase;
    use crate::types::Value;

    #[tokio::test]
    async fn test_owned_connection_closed_after_each_operation() {
        let db = MockDatabase::new().with_rows(vec![Row::from_pairs([("n", 1)])]);
        let repo = db.repository();

        let rows: Vec<Row> = repo
            .query("SELECT 1 AS n", &Params::new(), &CommandOptions::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(db.connections_opened(), 1);
        assert_eq!(db.connections_closed(), 1);
    }

    #[tokio::test]
    async fn test_named_parameters_bound_positionally() {
        let db = MockDatabase::new();
        let repo = db.repository();
        let params = Params::new().with("@id", 7).with("@name", "x");

        repo.execute(
            "UPDATE t SET name = @name WHERE id = @id OR parent = @id",
            &params,
            &CommandOptions::new(),
        )
        .await
        .unwrap();

        let statement = &db.statements()[0];
        assert_eq!(statement.sql, "UPDATE t SET name = $1 WHERE id = $2 OR parent = $2");
        assert_eq!(
            statement.params,
            vec![Value::String("x".into()), Value::Int32(7)]
        );
    }

    #[tokio::test]
    async fn test_missing_parameter_fails_before_connecting() {
        let db = MockDatabase::new();
        let repo = db.repository();

        let err = repo
            .execute("DELETE FROM t WHERE id = @id", &Params::new(), &CommandOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.layer(), crate::error::ErrorLayer::Validation);
        assert_eq!(db.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_single_or_default_rejects_second_row() {
        let db = MockDatabase::new().with_rows(vec![
            Row::from_pairs([("id", 1)]),
            Row::from_pairs([("id", 2)]),
            Row::from_pairs([("id", 3)]),
        ]);
        let repo = db.repository();

        let err = repo
            .single_or_default::<Row>("SELECT id FROM t", &Params::new(), &CommandOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MultipleRows { .. }));
        assert!(db.rows_streamed() <= 2);

        let first = repo
            .first_or_default::<Row>("SELECT id FROM t", &Params::new(), &CommandOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.get_by_name("id"), Some(&Value::Int32(1)));
    }

    #[tokio::test]
    async fn test_factory_caches_connection_strings() {
        let db = MockDatabase::new();
        let mut config = RepositoryConfig::default();
        config
            .connection_strings
            .insert("sales".to_string(), "postgres://db/sales".to_string());
        let factory = RepositoryFactory::from_config(Arc::new(db.factory()), config);

        assert!(factory.create("sales").is_ok());
        assert_eq!(factory.connection_string("sales").unwrap(), "postgres://db/sales");
        let err = factory.create("missing").unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Configuration);
    }
}
