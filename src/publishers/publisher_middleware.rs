use crate::{
    amqp::{configuration::PublisherSettings, Confirmation},
    codecs::{Compressor, Encryptor},
    messages::{Message, COMPRESSED_MARKER, ENCRYPTED_MARKER},
    pool::ChannelPool,
    publishers::PublisherError,
};
use std::sync::Arc;
use task_local_extensions::Extensions;
use tracing::warn;

#[async_trait::async_trait]
/// Middlewares to execute logic before and after a message is published by [`Publisher`].
///
/// # Use case
///
/// The main purpose of middlewares is to extract and centralise common non-business logic that would
/// otherwise have to be copy-pasted for all publishers.
/// With middlewares we can build re-usable components to perform common tasks across multiple
/// applications - e.g. logging, compression or encryption of messages.
///
/// # Extensions
///
/// `extensions` can be used to store values that are needed in this middleware on the way
/// back, after having called [`Next::run`], or should be shared with other middlewares downstream.
/// After the publishing itself, it holds the [`PublishAttempts`] that were needed.
///
/// [`Publisher`]: super::Publisher
pub trait PublisherMiddleware: Send + Sync {
    async fn handle(
        &self,
        message: Message,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<(), PublisherError>;
}

/// Number of attempts made to publish a message, stored in the middleware [`Extensions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAttempts(pub u32);

/// The remainder of the publishing middleware chain, including the final publishing action.
#[allow(missing_debug_implementations)]
pub struct Next<'a> {
    /// Channel pool to get a channel to actually execute the publishing action.
    pub(super) channel_pool: &'a ChannelPool,
    pub(super) settings: &'a PublisherSettings,
    /// Publish on an ackable channel and wait for the confirmation of the broker.
    pub(super) await_ack: bool,
    /// The remainder of the processing middleware chain.
    pub(super) next_middleware: &'a [Arc<dyn PublisherMiddleware>],
}

impl<'a> Next<'a> {
    /// Asynchronously execute the remaining processing middleware chain.
    pub async fn run(
        mut self,
        message: Message,
        extensions: &mut Extensions,
    ) -> Result<(), PublisherError> {
        // If there is at least one middleware in the chain, get a reference to it and store
        // the remaining ones in `next_middleware`.
        // Then call the middleware passing `self` in the handler, recursively.
        if let Some((current, next)) = self.next_middleware.split_first() {
            self.next_middleware = next;
            current.handle(message, extensions, self).await
        } else {
            // We have executed all middlewares (or simply there were none) and it's now
            // the turn of the publishing itself.
            let max_attempts = self.settings.max_retries.saturating_add(1);
            let mut attempts = 0;
            loop {
                attempts += 1;
                extensions.insert(PublishAttempts(attempts));
                match self.publish_once(&message).await {
                    Ok(()) => return Ok(()),
                    Err(e) if attempts < max_attempts && e.is_retriable() => {
                        warn!(
                            error = %e,
                            attempt = attempts,
                            "Failed to publish message, retrying in {:?}",
                            self.settings.retry_delay()
                        );
                        tokio::time::sleep(self.settings.retry_delay()).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// A single publishing attempt.
    ///
    /// Getting a channel, publishing and waiting for the confirmation share the same timeout.
    /// A channel whose publishing failed or timed out is poisoned: a late confirmation must not
    /// be attributed to the next message published on it.
    #[tracing::instrument(
        level = "debug",
        skip(self, message),
        fields(exchange = %message.exchange, routing_key = %message.routing_key)
    )]
    async fn publish_once(&self, message: &Message) -> Result<(), PublisherError> {
        let deadline = tokio::time::Instant::now() + self.settings.publish_timeout();
        let channel = tokio::time::timeout_at(deadline, async {
            if self.await_ack {
                self.channel_pool.get_ack_channel().await
            } else {
                self.channel_pool.get_channel().await
            }
        })
        .await
        .map_err(|_| PublisherError::TimeoutError)??;

        // The mandatory flag tells the broker how to react if the message cannot be routed
        // to a queue: returned when `true`, silently dropped when `false`.
        let mandatory = self.await_ack && self.settings.mandatory;
        let confirmation = tokio::time::timeout_at(deadline, async {
            match channel.basic_publish(message, mandatory).await {
                Ok(pending) => pending.await,
                Err(e) => Err(e),
            }
        })
        .await;

        match confirmation {
            Ok(Ok(confirmation)) => {
                self.channel_pool.return_channel(channel, false).await;
                match confirmation {
                    Confirmation::Ack | Confirmation::NotRequested => Ok(()),
                    Confirmation::Nack => Err(PublisherError::NegativeAck),
                    Confirmation::Returned {
                        reply_code,
                        reply_text,
                    } => Err(PublisherError::UnroutableMessage {
                        reply_code,
                        reply_text,
                    }),
                }
            }
            Ok(Err(e)) => {
                self.channel_pool.return_channel(channel, true).await;
                Err(PublisherError::GenericError(e.into()))
            }
            Err(_) => {
                self.channel_pool.return_channel(channel, true).await;
                Err(PublisherError::TimeoutError)
            }
        }
    }
}

/// Compress the payload of every message and record the compressor in the
/// [`COMPRESSED_MARKER`] metadata.
pub struct CompressionMiddleware {
    compressor: Arc<dyn Compressor>,
}

impl CompressionMiddleware {
    pub fn new(compressor: Arc<dyn Compressor>) -> Self {
        Self { compressor }
    }
}

#[async_trait::async_trait]
impl PublisherMiddleware for CompressionMiddleware {
    async fn handle(
        &self,
        mut message: Message,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<(), PublisherError> {
        message.payload = self
            .compressor
            .compress(&message.payload)
            .map_err(PublisherError::MiddlewareError)?;
        message
            .metadata
            .insert(COMPRESSED_MARKER.into(), self.compressor.name().into());
        next.run(message, extensions).await
    }
}

/// Encrypt the payload of every message and record the encryptor in the
/// [`ENCRYPTED_MARKER`] metadata.
pub struct EncryptionMiddleware {
    encryptor: Arc<dyn Encryptor>,
}

impl EncryptionMiddleware {
    pub fn new(encryptor: Arc<dyn Encryptor>) -> Self {
        Self { encryptor }
    }
}

#[async_trait::async_trait]
impl PublisherMiddleware for EncryptionMiddleware {
    async fn handle(
        &self,
        mut message: Message,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<(), PublisherError> {
        message.payload = self
            .encryptor
            .encrypt(&message.payload)
            .map_err(PublisherError::MiddlewareError)?;
        message
            .metadata
            .insert(ENCRYPTED_MARKER.into(), self.encryptor.name().into());
        next.run(message, extensions).await
    }
}
