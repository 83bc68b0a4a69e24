//! Helpers for connecting to a rabbitmq broker

pub mod configuration;
pub mod convenience;
mod factory;
pub mod memory;
pub mod transport;

pub use factory::ConnectionFactory;
pub use memory::InMemoryBroker;
pub use transport::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, Confirmation,
    Delivery, DeliveryStream, PendingConfirmation,
};

pub use lapin::BasicProperties;
