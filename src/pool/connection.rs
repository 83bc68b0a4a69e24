//! Implements [`Manager`] for [`ConnectionHost`].
use crate::amqp::configuration::PoolSettings;
use crate::amqp::{BrokerChannel, BrokerConnection, BrokerConnector, BrokerError};
use deadpool::managed::{self, Manager, Object, PoolError};
use futures_util::future::try_join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// A connection to the broker owned by the [`ConnectionPool`].
pub struct ConnectionHost {
    id: u64,
    name: String,
    connection: Arc<dyn BrokerConnection>,
}

impl ConnectionHost {
    /// Identifier assigned by the pool, unique for the lifetime of the pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The name the connection was registered with on the broker.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }

    pub async fn is_healthy(&self) -> bool {
        self.connection.is_open()
    }

    pub async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        self.connection.create_channel().await
    }
}

impl std::fmt::Debug for ConnectionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHost")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// `ConnectionManager` implements [`Manager`] to create and health-check the connections
/// of a [`ConnectionPool`].
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    connection_name: String,
    next_id: AtomicU64,
    /// Every connection created by the manager, to close the ones still alive on shutdown.
    created: Mutex<Vec<Weak<dyn BrokerConnection>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, connection_name: impl Into<String>) -> Self {
        Self {
            connector,
            connection_name: connection_name.into(),
            next_id: AtomicU64::new(0),
            created: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, connection: &Arc<dyn BrokerConnection>) {
        let mut created = self.created.lock().unwrap_or_else(PoisonError::into_inner);
        created.retain(|c| c.strong_count() > 0);
        created.push(Arc::downgrade(connection));
    }

    fn alive_connections(&self) -> Vec<Arc<dyn BrokerConnection>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect()
    }
}

#[async_trait::async_trait]
impl Manager for ConnectionManager {
    type Type = ConnectionHost;
    type Error = super::Error;

    async fn create(&self) -> Result<ConnectionHost, super::Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}:{}", self.connection_name, id);
        let connection = self.connector.connect(&name).await?;
        self.register(&connection);
        debug!(connection_id = id, "Opened connection {}", name);
        Ok(ConnectionHost {
            id,
            name,
            connection,
        })
    }

    /// Only connections closed for good are replaced. Unhealthy ones stay in the pool: they
    /// are skipped by [`ConnectionPool::get_connection`] until they recover.
    async fn recycle(&self, host: &mut ConnectionHost) -> managed::RecycleResult<super::Error> {
        if !host.connection.is_closed() {
            return Ok(());
        }
        warn!(
            connection_id = host.id,
            "Discarding connection {}: it has been closed", host.name
        );
        Err(managed::RecycleError::Message(format!(
            "Connection {} has been closed",
            host.name
        )))
    }
}

/// A [`ConnectionHost`] lent by the [`ConnectionPool`]. It goes back to the pool on drop.
pub type PooledConnection = Object<ConnectionManager>;

/// `ConnectionPool` is a health-checked pool of broker connections.
///
/// Idle connections are checked before being lent. An unhealthy connection goes back to the
/// pool and is not lent until it reports healthy again. A closed connection is replaced.
#[derive(Clone)]
pub struct ConnectionPool {
    pool: managed::Pool<ConnectionManager>,
    sleep_on_error_interval: Duration,
}

impl ConnectionPool {
    /// Build the pool and eagerly open `settings.max_connections` connections.
    ///
    /// It fails if any of those connections cannot be established.
    pub async fn new(
        connector: impl BrokerConnector,
        settings: &PoolSettings,
    ) -> Result<Self, super::Error> {
        if settings.max_connections == 0 {
            return Err(anyhow::anyhow!("The connection pool needs at least one connection").into());
        }
        let manager = ConnectionManager::new(Arc::new(connector), settings.connection_name.clone());
        let pool = managed::Pool::builder(manager)
            .max_size(settings.max_connections)
            .build()
            .map_err(|e| anyhow::anyhow!("Could not build connection pool: {e}"))?;

        let prefill = try_join_all((0..settings.max_connections).map(|_| pool.get())).await?;
        drop(prefill);
        debug!(
            "Connection pool ready with {} connections",
            settings.max_connections
        );

        Ok(Self {
            pool,
            sleep_on_error_interval: settings.sleep_on_error_interval(),
        })
    }

    /// Borrow a healthy connection.
    ///
    /// An unhealthy connection is returned to the back of the pool and the caller sleeps
    /// `sleep_on_error_interval` before trying the next one. The same happens when a closed
    /// connection cannot be replaced because the broker is down. It only fails once the pool
    /// has been shut down.
    pub async fn get_connection(&self) -> Result<PooledConnection, super::Error> {
        loop {
            match self.pool.get().await {
                Ok(connection) if connection.is_healthy().await => return Ok(connection),
                Ok(connection) => {
                    warn!(
                        connection_id = connection.id(),
                        "Connection {} is not in an healthy state, retrying in {:?}",
                        connection.name(),
                        self.sleep_on_error_interval
                    );
                    self.return_connection(connection);
                }
                Err(PoolError::Closed) => return Err(super::Error::Closed),
                Err(e) => {
                    warn!(
                        error = %e,
                        "Failed to get a healthy connection, retrying in {:?}",
                        self.sleep_on_error_interval
                    );
                }
            }
            tokio::time::sleep(self.sleep_on_error_interval).await;
        }
    }

    /// Give a connection back to the pool.
    pub fn return_connection(&self, connection: PooledConnection) {
        drop(connection);
    }

    /// Open a connection that is not managed by the pool. Closing it is up to the caller.
    pub async fn create_connection(
        &self,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.pool.manager().connector.connect(connection_name).await
    }

    pub fn status(&self) -> managed::Status {
        self.pool.status()
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub(crate) fn sleep_on_error_interval(&self) -> Duration {
        self.sleep_on_error_interval
    }

    /// Stop lending connections and close every connection the pool has opened.
    ///
    /// Connections currently borrowed are closed as well. Failures are logged and ignored.
    #[tracing::instrument(name = "connection_pool_shutdown", skip(self))]
    pub async fn shutdown(&self) {
        // Upgrade first: closing the pool drops the idle hosts.
        let connections = self.pool.manager().alive_connections();
        self.pool.close();
        for connection in connections {
            if let Err(e) = connection.close().await {
                warn!(error = ?e, "Failed to close connection during shutdown");
            }
        }
    }
}
