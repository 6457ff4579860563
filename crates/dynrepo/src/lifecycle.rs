//! Connection ownership and ambient transaction tracking
//!
//! A repository either opens a connection per operation (Owned) or works on
//! one injected by a unit of work (Borrowed). Every operation goes through a
//! [`ConnectionLease`], which records who owns the connection so that only
//! owned connections are ever closed by the repository.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Executor, Transaction};
use crate::error::{Error, Result};

/// Who is responsible for closing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Opened by the repository; closed when the lease is released
    Owned,
    /// Injected by the caller; never closed by the repository
    Borrowed,
}

/// What the manager currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing injected; each operation opens and closes its own connection
    Unset,
    /// A connection and/or transaction was injected
    Borrowed,
}

/// Hands out connection leases and tracks unit-of-work injection
pub struct ConnectionLifecycleManager {
    factory: Arc<dyn ConnectionFactory>,
    config: ConnectionConfig,
    connection: Option<Arc<dyn Connection>>,
    transaction: Option<Arc<dyn Transaction>>,
}

impl std::fmt::Debug for ConnectionLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLifecycleManager")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("in_transaction", &self.has_ambient_transaction())
            .finish()
    }
}

impl ConnectionLifecycleManager {
    /// Create a manager that opens connections through `factory`
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: ConnectionConfig) -> Self {
        Self {
            factory,
            config,
            connection: None,
            transaction: None,
        }
    }

    /// Connection configuration used for owned connections
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Use an externally managed connection
    pub fn set_connection(&mut self, connection: Arc<dyn Connection>) {
        self.connection = Some(connection);
    }

    /// Enlist subsequent commands in an externally managed transaction
    pub fn set_transaction(&mut self, transaction: Arc<dyn Transaction>) {
        self.transaction = Some(transaction);
    }

    /// Drop references to the injected connection and transaction.
    ///
    /// Neither is closed, committed or rolled back. Idempotent.
    pub fn clear_transaction(&mut self) {
        let released = self.transaction.take().is_some() | self.connection.take().is_some();
        if released {
            debug!("Released unit-of-work connection references");
        }
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        if self.connection.is_some() || self.transaction.is_some() {
            LifecycleState::Borrowed
        } else {
            LifecycleState::Unset
        }
    }

    /// Whether commands are enlisted in an injected transaction
    pub fn has_ambient_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Lease a connection for one operation attempt
    pub async fn acquire(&self) -> Result<ConnectionLease> {
        let handle = match (&self.connection, &self.transaction) {
            (Some(connection), _) => LeaseHandle::Borrowed(Arc::clone(connection)),
            (None, Some(transaction)) => LeaseHandle::Enlisted(Arc::clone(transaction)),
            (None, None) => {
                let connection = self.factory.connect(&self.config).await?;
                debug!(url = %self.config.redacted_url(), "Opened owned connection");
                LeaseHandle::Owned(Arc::from(connection))
            }
        };

        Ok(ConnectionLease {
            handle,
            transaction: self.transaction.clone(),
            released: false,
        })
    }
}

enum LeaseHandle {
    Owned(Arc<dyn Connection>),
    Borrowed(Arc<dyn Connection>),
    Enlisted(Arc<dyn Transaction>),
}

/// A connection held for the duration of one operation attempt.
///
/// Commands go through the ambient transaction when there is one. Release
/// closes the connection only when it is [`Ownership::Owned`]. An owned lease
/// dropped without release (timeout, cancellation, an abandoned stream) has
/// its connection closed on a spawned task.
pub struct ConnectionLease {
    handle: LeaseHandle,
    transaction: Option<Arc<dyn Transaction>>,
    released: bool,
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("ownership", &self.ownership())
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

impl ConnectionLease {
    /// Ownership tag
    pub fn ownership(&self) -> Ownership {
        match self.handle {
            LeaseHandle::Owned(_) => Ownership::Owned,
            LeaseHandle::Borrowed(_) | LeaseHandle::Enlisted(_) => Ownership::Borrowed,
        }
    }

    /// Whether commands run inside an injected transaction
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// The injected transaction, if any
    pub fn transaction(&self) -> Option<&Arc<dyn Transaction>> {
        self.transaction.as_ref()
    }

    /// The underlying connection, when the lease holds one
    pub fn connection(&self) -> Option<&dyn Connection> {
        match &self.handle {
            LeaseHandle::Owned(connection) => Some(connection.as_ref()),
            LeaseHandle::Borrowed(connection) => Some(connection.as_ref()),
            LeaseHandle::Enlisted(_) => None,
        }
    }

    /// Where commands should be sent
    pub fn executor(&self) -> &dyn Executor {
        if let Some(transaction) = &self.transaction {
            return transaction.as_executor();
        }
        match &self.handle {
            LeaseHandle::Owned(connection) => connection.as_executor(),
            LeaseHandle::Borrowed(connection) => connection.as_executor(),
            LeaseHandle::Enlisted(transaction) => transaction.as_executor(),
        }
    }

    /// Begin a transaction owned by this operation.
    ///
    /// Fails when the lease is already enlisted in an ambient transaction.
    pub async fn begin(&self) -> Result<Box<dyn Transaction>> {
        if self.in_transaction() {
            return Err(Error::transaction(
                "an ambient transaction is active; nested transactions are not started",
            ));
        }
        match self.connection() {
            Some(connection) => connection.begin().await,
            None => Err(Error::transaction("lease holds no connection")),
        }
    }

    /// End the lease, closing the connection if it is owned
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match &self.handle {
            LeaseHandle::Owned(connection) => {
                connection.close().await?;
                debug!("Closed owned connection");
                Ok(())
            }
            LeaseHandle::Borrowed(_) | LeaseHandle::Enlisted(_) => Ok(()),
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let LeaseHandle::Owned(connection) = &self.handle else {
            return;
        };
        let connection = Arc::clone(connection);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match connection.close().await {
                        Ok(()) => debug!("Closed owned connection of a dropped lease"),
                        Err(e) => warn!(error = %e, "Failed to close owned connection of a dropped lease"),
                    }
                });
            }
            Err(_) => warn!("Owned lease dropped outside a runtime; connection left to its destructor"),
        }
    }
}
