//! Implements [`Manager`] for [`ChannelHost`].
use super::connection::ConnectionPool;
use crate::amqp::configuration::PoolSettings;
use crate::amqp::{BrokerChannel, BrokerConnection, BrokerConnector};
use deadpool::managed::{self, Manager, Object};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// A channel opened on one of the connections of the [`ConnectionPool`].
///
/// The host does not keep its connection alive: it only holds a weak reference to it, used to
/// check that the connection is still healthy.
pub struct ChannelHost {
    id: u64,
    connection_id: u64,
    connection: Weak<dyn BrokerConnection>,
    ackable: bool,
    transient: bool,
    channel: Box<dyn BrokerChannel>,
}

impl ChannelHost {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The id of the [`ConnectionHost`](super::ConnectionHost) the channel was opened on.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Whether publisher confirms are enabled on the channel.
    pub fn is_ackable(&self) -> bool {
        self.ackable
    }

    /// Whether the channel lives outside of the pool.
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Both the channel and the connection it was opened on are open.
    pub fn is_healthy(&self) -> bool {
        self.channel.is_open()
            && self
                .connection
                .upgrade()
                .map_or(false, |connection| connection.is_open())
    }

    pub fn channel(&self) -> &dyn BrokerChannel {
        self.channel.as_ref()
    }
}

impl Deref for ChannelHost {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl std::fmt::Debug for ChannelHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHost")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("ackable", &self.ackable)
            .field("transient", &self.transient)
            .finish()
    }
}

/// `ChannelManager` implements [`Manager`] to manage a pool of [`ChannelHost`]s.
///
/// `ChannelManager` keeps an internal [`ConnectionPool`]
/// in order to reuse connections across channels.
pub struct ChannelManager {
    connection_pool: ConnectionPool,
    ackable: bool,
    next_id: Arc<AtomicU64>,
}

impl ChannelManager {
    /// Open a channel, borrowing a connection only for the time it takes.
    async fn try_create(&self, transient: bool) -> Result<ChannelHost, super::Error> {
        let connection = self.connection_pool.get_connection().await?;
        let channel = connection.create_channel().await?;
        if self.ackable {
            channel.confirm_select().await?;
        }
        let host = ChannelHost {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            connection_id: connection.id(),
            connection: Arc::downgrade(connection.connection()),
            ackable: self.ackable,
            transient,
            channel,
        };
        self.connection_pool.return_connection(connection);
        Ok(host)
    }

    /// Open a channel, trying again after `sleep_on_error_interval` until it succeeds or the
    /// connection pool is shut down.
    async fn create_with_retry(&self, transient: bool) -> Result<ChannelHost, super::Error> {
        loop {
            match self.try_create(transient).await {
                Ok(host) => {
                    debug!(
                        channel_id = host.id,
                        connection_id = host.connection_id,
                        ackable = host.ackable,
                        "Opened channel"
                    );
                    return Ok(host);
                }
                Err(super::Error::Closed) => return Err(super::Error::Closed),
                Err(e) => {
                    let interval = self.connection_pool.sleep_on_error_interval();
                    warn!(error = ?e, "Failed to open a channel, retrying in {:?}", interval);
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Manager for ChannelManager {
    type Type = ChannelHost;
    type Error = super::Error;

    async fn create(&self) -> Result<ChannelHost, super::Error> {
        self.create_with_retry(false).await
    }

    async fn recycle(&self, host: &mut ChannelHost) -> managed::RecycleResult<super::Error> {
        if host.is_healthy() {
            return Ok(());
        }
        debug!(channel_id = host.id, "Discarding unhealthy channel");
        if let Err(e) = host.channel.close().await {
            debug!(error = ?e, channel_id = host.id, "Failed to close unhealthy channel");
        }
        Err(managed::RecycleError::Message(format!(
            "Channel {} is not in an healthy state",
            host.id
        )))
    }
}

/// A [`ChannelHost`] lent by the [`ChannelPool`]. It goes back to the pool on drop.
pub type PooledChannel = Object<ChannelManager>;

/// `ChannelPool` pools [`ChannelHost`]s.
///
/// Plain channels and ackable channels (publisher confirms enabled) are pooled separately,
/// each pool being bounded by `max_channels`.
#[derive(Clone)]
pub struct ChannelPool {
    connection_pool: ConnectionPool,
    channels: managed::Pool<ChannelManager>,
    ack_channels: managed::Pool<ChannelManager>,
}

impl ChannelPool {
    pub fn new(
        connection_pool: ConnectionPool,
        settings: &PoolSettings,
    ) -> Result<Self, super::Error> {
        if settings.max_channels == 0 {
            return Err(anyhow::anyhow!("The channel pool needs at least one channel").into());
        }
        let next_id = Arc::new(AtomicU64::new(0));
        let build = |ackable: bool| {
            let manager = ChannelManager {
                connection_pool: connection_pool.clone(),
                ackable,
                next_id: Arc::clone(&next_id),
            };
            managed::Pool::builder(manager)
                .max_size(settings.max_channels)
                .build()
                .map_err(|e| anyhow::anyhow!("Could not build channel pool: {e}"))
        };
        Ok(Self {
            channels: build(false)?,
            ack_channels: build(true)?,
            connection_pool,
        })
    }

    /// Build the connection pool and the channel pools on top of it.
    pub async fn connect(
        connector: impl BrokerConnector,
        settings: &PoolSettings,
    ) -> Result<Self, super::Error> {
        let connection_pool = ConnectionPool::new(connector, settings).await?;
        Self::new(connection_pool, settings)
    }

    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.connection_pool
    }

    /// Borrow a channel without publisher confirms.
    pub async fn get_channel(&self) -> Result<PooledChannel, super::Error> {
        Ok(self.channels.get().await?)
    }

    /// Borrow a channel with publisher confirms enabled.
    pub async fn get_ack_channel(&self) -> Result<PooledChannel, super::Error> {
        Ok(self.ack_channels.get().await?)
    }

    /// Give a channel back to the pool.
    ///
    /// A `poisoned` channel is removed from the pool and closed: the pool opens a new one
    /// when it needs it.
    pub async fn return_channel(&self, channel: PooledChannel, poisoned: bool) {
        if !poisoned {
            drop(channel);
            return;
        }
        let host = Object::take(channel);
        warn!(channel_id = host.id, "Discarding poisoned channel");
        if let Err(e) = host.channel.close().await {
            debug!(error = ?e, channel_id = host.id, "Failed to close poisoned channel");
        }
    }

    /// Open a channel that is not managed by the pool. Closing it is up to the caller.
    pub async fn get_transient_channel(&self, ackable: bool) -> Result<ChannelHost, super::Error> {
        let pool = if ackable {
            &self.ack_channels
        } else {
            &self.channels
        };
        pool.manager().create_with_retry(true).await
    }

    pub fn channel_status(&self) -> managed::Status {
        self.channels.status()
    }

    pub fn ack_channel_status(&self) -> managed::Status {
        self.ack_channels.status()
    }

    /// Close both channel pools, then the connection pool.
    pub async fn shutdown(&self) {
        self.channels.close();
        self.ack_channels.close();
        self.connection_pool.shutdown().await;
    }
}
