//! The message type shared by [`Publisher`](crate::publishers::Publisher) and
//! [`Consumer`](crate::consumers::Consumer).
use std::collections::BTreeMap;

/// Metadata key recording the name of the compression provider applied to the payload.
pub const COMPRESSED_MARKER: &str = "x-compressed";
/// Metadata key recording the name of the encryption provider applied to the payload.
pub const ENCRYPTED_MARKER: &str = "x-encrypted";

/// A message travelling through the broker.
///
/// The payload and the routing information are what RabbitMq cares about. `metadata` is
/// a free-form bag, carried as AMQP headers, that the framework uses to record which
/// transformations (compression, encryption) have been applied to the payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// The body of the message - as a sequence of bytes.
    pub payload: Vec<u8>,
    /// The name of the exchange the message is published to.
    /// The empty string is the default exchange.
    pub exchange: String,
    /// The routing key used by the exchange to determine the destination queues.
    pub routing_key: String,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    /// Seconds since the UNIX epoch.
    pub timestamp: Option<u64>,
    /// Carried as AMQP headers.
    pub metadata: BTreeMap<String, String>,
}

impl Message {
    /// A message published to the default exchange: it is routed to the queue named after
    /// `queue_name`.
    pub fn to_queue(queue_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            routing_key: queue_name.into(),
            ..Self::default()
        }
    }

    /// A message published to `exchange` with `routing_key`.
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            payload: payload.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, value: impl Into<String>) -> Self {
        self.correlation_id = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_message_id(mut self, value: impl Into<String>) -> Self {
        self.message_id = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The name of the compression provider applied to the payload, if any.
    pub fn compressed_with(&self) -> Option<&str> {
        self.metadata.get(COMPRESSED_MARKER).map(String::as_str)
    }

    /// The name of the encryption provider applied to the payload, if any.
    pub fn encrypted_with(&self) -> Option<&str> {
        self.metadata.get(ENCRYPTED_MARKER).map(String::as_str)
    }
}
