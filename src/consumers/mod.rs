//! Facilities to consume messages from a RabbitMq queue. Check out [`Consumer`] as a starting point.
mod consumer;
mod error;
mod received_message;

pub use consumer::Consumer;
pub use error::ConsumerError;
pub use received_message::ReceivedMessage;
