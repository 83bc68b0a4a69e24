//! Pooling of broker connections and channels, using [`deadpool`].
//!
//! This module provides two key guarantees:
//! - Disposing of broken connections and channels and recreating new ones on-demand.
//! - Reusing connection objects across channels to limit overhead.
//!
//! ```rust
//! use carrot_flow::pool::ChannelPool;
//! use carrot_flow::amqp::ConnectionFactory;
//! use carrot_flow::amqp::configuration::{PoolSettings, RabbitMqSettings};
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     // initialize rabbitmq connection details and config.
//!     let settings = RabbitMqSettings::default();
//!     let pool_settings = PoolSettings {
//!         max_connections: 4,
//!         max_channels: 16,
//!         ..PoolSettings::default()
//!     };
//!
//!     // open the connections and build the channel pools on top of them.
//!     let pool =
//!         ChannelPool::connect(ConnectionFactory::new_from_config(&settings)?, &pool_settings)
//!             .await?;
//!
//!     // get a new Channel from the pool.
//!     let channel = pool.get_ack_channel().await?;
//!     pool.return_channel(channel, false).await;
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;

pub use channel::{ChannelHost, ChannelManager, ChannelPool, PooledChannel};
pub use connection::{ConnectionHost, ConnectionManager, ConnectionPool, PooledConnection};
pub use error::Error;
