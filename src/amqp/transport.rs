//! `transport` defines the interface of the broker client the rest of the crate is built on:
//! connections, channels and the acknowledgement handle attached to every delivery.
//!
//! [`ConnectionFactory`](super::ConnectionFactory) implements it on top of [`lapin`],
//! [`InMemoryBroker`](super::memory::InMemoryBroker) implements it in-process.
use crate::messages::Message;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// Errors returned by the broker client.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("The connection with the RabbitMq broker is closed")]
    ConnectionClosed,
    #[error("The channel is closed")]
    ChannelClosed,
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    Protocol(#[source] anyhow::Error),
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidConnectionState(_) => Self::ConnectionClosed,
            lapin::Error::InvalidChannelState(_) => Self::ChannelClosed,
            err => Self::Protocol(err.into()),
        }
    }
}

/// The broker's answer to a publish on a channel with publisher confirms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The broker took responsibility for the message.
    Ack,
    /// The broker refused the message.
    Nack,
    /// The message could not be routed and was returned (mandatory publishing).
    Returned { reply_code: u16, reply_text: String },
    /// Publisher confirms are not enabled on the channel.
    NotRequested,
}

/// Resolves once the broker confirms (or refuses) a published message.
pub type PendingConfirmation = BoxFuture<'static, Result<Confirmation, BrokerError>>;

/// The stream of deliveries of a subscription.
///
/// It yields an error, or ends, when the subscription is torn down by the broker.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Establishes new connections to the broker.
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    /// Open a new connection. `connection_name` is reported to the broker, where supported.
    async fn connect(&self, connection_name: &str)
        -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A connection to the broker. Connections are expensive and multiplex many channels.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// The connection is established and usable right now.
    fn is_open(&self) -> bool;

    /// The connection has been closed, by either side, and will never be usable again.
    ///
    /// A connection can be neither open nor closed, e.g. while it is being established or
    /// when the broker reports it as blocked.
    fn is_closed(&self) -> bool;

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A lightweight session multiplexed over a [`BrokerConnection`].
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    /// Enable publisher confirms on this channel.
    async fn confirm_select(&self) -> Result<(), BrokerError>;

    /// Limit the number of unacknowledged deliveries pushed to consumers on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Publish `message`, returning a future that resolves with the broker confirmation.
    ///
    /// If `mandatory` is set, unroutable messages are returned by the broker instead of being
    /// silently dropped.
    async fn basic_publish(
        &self,
        message: &Message,
        mandatory: bool,
    ) -> Result<PendingConfirmation, BrokerError>;

    async fn basic_consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Settles a single delivery with the broker.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message pushed by the broker to a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub message: Message,
    /// `None` if the subscription is in auto-ack mode.
    pub acker: Option<Arc<dyn Acknowledger>>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("message", &self.message)
            .finish()
    }
}
