//! Facilities to publish messages to a RabbitMq exchange. Check out [`Publisher`] as a starting point.
mod publisher;
mod publisher_middleware;
mod receipt;

pub use publisher::{Publisher, PublisherBuilder, PublisherError, PublisherState};
pub use publisher_middleware::{
    CompressionMiddleware, EncryptionMiddleware, Next, PublishAttempts, PublisherMiddleware,
};
pub use receipt::{ClosureReceiptHandler, PublishOutcome, PublishReceipt, ReceiptHandler};
