//! `carrot-flow` is a toolkit to publish and consume RabbitMq messages, built on top of
//! [`lapin`].
//!
//! - [`ChannelPool`](crate::pool::ChannelPool) shares a bounded set of connections and
//!   channels between many tasks;
//! - [`Publisher`](crate::publishers::Publisher) publishes messages through a middleware chain,
//!   with publisher confirms, retries and a background queue;
//! - [`Consumer`](crate::consumers::Consumer) streams deliveries from a queue and recovers
//!   from channel failures;
//! - [`ConsumerDataflow`](crate::dataflow::ConsumerDataflow) runs consumed messages through a
//!   staged, concurrent processing pipeline.
//!
//! [`InMemoryBroker`](crate::amqp::InMemoryBroker) stands in for RabbitMq in tests.

pub mod amqp;
pub mod codecs;
pub mod consumers;
pub mod dataflow;
pub mod messages;
pub mod pool;
pub mod publishers;
