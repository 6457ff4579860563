//! # dynrepo
//!
//! Resilient dynamic data access for relational databases.
//!
//! A [`Repository`](repository::Repository) issues parameterized SQL against a
//! backend and takes care of the parts every data-access layer ends up
//! re-implementing:
//!
//! - **Retry**: transient failures (timeouts, deadlocks, dropped connections)
//!   are re-executed with exponential backoff
//! - **Unit of Work**: an externally owned connection or transaction can be
//!   injected; the repository never closes or commits what it did not open
//! - **Dynamic SQL**: pagination, filtering and `COUNT(*)` derivation with
//!   sort columns and routine names checked by a layered identifier sanitizer
//! - **Materialization**: rows mapped to records as lists, single rows,
//!   scalars, pages, multiple result sets or lazy streams
//! - **Bulk loading**: batched copy-protocol loads next to row-at-a-time
//!   batches
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dynrepo::prelude::*;
//!
//! let config = RepositoryConfig::from_file("repository.yaml")?;
//! let factory = RepositoryFactory::from_config(Arc::new(PgConnectionFactory), config);
//! let repo = factory.create("sales")?;
//!
//! let page: PagedResult<Row> = repo
//!     .get_paged(
//!         "SELECT * FROM orders WHERE status = @status",
//!         &Params::new().with("@status", "open"),
//!         &PageRequest::new(1, 25).with_filter(
//!             FilterRequest::new().sort_by("created_at", SortDirection::Desc),
//!         ),
//!         &CommandOptions::new(),
//!     )
//!     .await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` (default) - PostgreSQL backend via tokio-postgres

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod bulk;
pub mod command;
pub mod compose;
pub mod config;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod filter;
pub mod lifecycle;
pub mod materialize;
pub mod params;
pub mod repository;
pub mod retry;
pub mod security;
pub mod strategy;
pub mod testing;
pub mod types;

// Backend implementations (conditionally compiled)
#[cfg(feature = "postgres")]
pub mod postgres;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, ErrorLayer, Result};

    // Value and type system
    pub use crate::types::{Row, Value};

    // Connection traits and config
    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionFactory, DatabaseType, Executor, RowStream,
        Transaction,
    };

    // Dialects
    pub use crate::dialect::{dialect_for, PostgresDialect, SqlDialect, SqlServerDialect};

    // Requests and results
    pub use crate::command::{CommandKind, CommandOptions};
    pub use crate::filter::{FilterRequest, PageRequest, PagedResult, SortDirection, SortSpec};
    pub use crate::params::Params;
    pub use crate::strategy::{NamingConvention, ParameterStrategy};

    // Materialization
    pub use crate::materialize::{FromRow, FromValue, RecordStream, ResultSets, RowMapper};

    // Loading
    pub use crate::bulk::{BulkOptions, BulkPayload};

    // Configuration and resilience
    pub use crate::config::{ConfigConnectionStrings, ConnectionStringResolver, RepositoryConfig};
    pub use crate::retry::RetryPolicy;

    // Facade
    pub use crate::lifecycle::{LifecycleState, Ownership};
    pub use crate::repository::{Repository, RepositoryFactory};

    #[cfg(feature = "postgres")]
    pub use crate::postgres::PgConnectionFactory;
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use types::{Row, Value};

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _value = Value::Int32(42);
        let _config = ConnectionConfig::new("postgres://localhost/test");
        let _options = CommandOptions::new();
        let _page = PageRequest::new(1, 10);
    }

    #[test]
    fn test_error_types() {
        let err = Error::connection("test error");
        assert!(err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Connection);
        assert_eq!(err.layer(), ErrorLayer::Provider);
    }

    #[test]
    fn test_dialect_selection() {
        assert_eq!(dialect_for("postgres").name(), "PostgreSQL");
        assert_eq!(dialect_for("sqlserver").name(), "SQL Server");
    }
}
