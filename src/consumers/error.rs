use crate::amqp::BrokerError;

/// Error returned when starting or stopping a [`Consumer`](super::Consumer).
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to get a channel from the pool")]
    Pool(#[from] crate::pool::Error),
    #[error("Failed to subscribe to the queue")]
    Broker(#[from] BrokerError),
}
