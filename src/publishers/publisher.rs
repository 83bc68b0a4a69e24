use crate::amqp::configuration::PublisherSettings;
use crate::codecs::{Compressor, Encryptor};
use crate::messages::Message;
use crate::pool::ChannelPool;
use crate::publishers::publisher_middleware::{
    CompressionMiddleware, EncryptionMiddleware, Next, PublishAttempts,
};
use crate::publishers::receipt::{PublishOutcome, PublishReceipt, ReceiptHandler};
use crate::publishers::PublisherMiddleware;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use task_local_extensions::Extensions;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// A high-level interface to publish messages.
///
/// It supports middlewares which can be used for a variety of purposes (e.g. injecting headers,
/// compressing payloads, registering metrics, etc.).
///
/// Messages can be published directly, with [`Publisher::publish`], or queued with
/// [`Publisher::queue_message`] and published in the background by the auto-publish loop
/// started with [`Publisher::start_auto_publish`]. Every queued message yields a
/// [`PublishReceipt`].
///
/// # Fault tolerance
///
/// Channels come from a [`ChannelPool`]: broken channels and connections are replaced
/// transparently. Failed attempts are retried with a fixed delay, up to
/// [`PublisherSettings::max_retries`] times.
///
/// # How do I build a `Publisher`?
///
/// `Publisher` provides a fluent API to add configuration step-by-step, known as
/// "builder pattern" in Rust.
/// The starting point is [`Publisher::builder`].
pub struct Publisher {
    core: Arc<PublisherCore>,
    state: Mutex<PublisherState>,
    queue: Mutex<Option<mpsc::Sender<Message>>>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

/// Lifecycle of the auto-publish loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct PublisherCore {
    /// Channel pool for the underlying AMQP channel.
    channel_pool: ChannelPool,
    settings: PublisherSettings,
    /// The middleware chain that will be executed before publishing the message.
    middleware_chain: Vec<Arc<dyn PublisherMiddleware + 'static>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Publisher {
    /// Start building a [`Publisher`].
    ///
    /// You will need a channel pool.
    ///
    /// # Example
    ///
    /// ```rust
    /// use carrot_flow::amqp::configuration::{PoolSettings, RabbitMqSettings};
    /// use carrot_flow::amqp::ConnectionFactory;
    /// use carrot_flow::pool::ChannelPool;
    /// use carrot_flow::publishers::Publisher;
    ///
    /// pub async fn get_publisher() -> anyhow::Result<Publisher> {
    ///     let settings = RabbitMqSettings::default();
    ///     let connection_factory = ConnectionFactory::new_from_config(&settings)?;
    ///     let channel_pool =
    ///         ChannelPool::connect(connection_factory, &PoolSettings::default()).await?;
    ///
    ///     Ok(Publisher::builder(channel_pool)
    ///         .publish_timeout(std::time::Duration::from_secs(3))
    ///         .build())
    /// }
    /// ```
    pub fn builder(channel_pool: ChannelPool) -> PublisherBuilder {
        PublisherBuilder::new(channel_pool)
    }

    pub fn state(&self) -> PublisherState {
        *lock(&self.state)
    }

    /// Publish a message to RabbitMq, bypassing the auto-publish queue.
    ///
    /// If `await_ack` is set, the message is published on a channel with publisher confirms
    /// and the confirmation of the broker is awaited.
    pub async fn publish(&self, message: Message, await_ack: bool) -> Result<(), PublisherError> {
        self.core.publish(inject_amqp_properties(message), await_ack).await.0
    }

    /// Hand a message over to the auto-publish loop.
    ///
    /// It waits for room in the queue and returns once the message has been accepted: its
    /// [`PublishReceipt`] will be delivered to the receipt handler.
    pub async fn queue_message(&self, message: Message) -> Result<(), PublisherError> {
        let queue = lock(&self.queue)
            .clone()
            .ok_or(PublisherError::NotRunning)?;
        queue
            .send(message)
            .await
            .map_err(|_| PublisherError::NotRunning)
    }

    /// Spawn the auto-publish loop, which drains the queue fed by [`Publisher::queue_message`],
    /// and the loop delivering [`PublishReceipt`]s to `receipt_handler`.
    pub async fn start_auto_publish(
        &self,
        receipt_handler: Arc<dyn ReceiptHandler>,
    ) -> Result<(), PublisherError> {
        {
            let mut state = lock(&self.state);
            if *state != PublisherState::Stopped {
                return Err(PublisherError::AlreadyRunning);
            }
            *state = PublisherState::Starting;
        }

        let settings = &self.core.settings;
        let (queue_sender, queue_receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let (receipt_sender, receipt_receiver) = mpsc::channel(settings.receipt_capacity.max(1));
        let publish_loop = tokio::spawn(publish_loop(
            Arc::clone(&self.core),
            queue_receiver,
            receipt_sender,
        ));
        let receipt_loop = tokio::spawn(receipt_loop(receipt_receiver, receipt_handler));

        *lock(&self.queue) = Some(queue_sender);
        *lock(&self.tasks) = Some((publish_loop, receipt_loop));
        *lock(&self.state) = PublisherState::Running;
        debug!("Auto-publish started");
        Ok(())
    }

    /// Stop accepting new messages, publish everything that was already accepted, deliver the
    /// last receipts and wait for both loops to exit.
    pub async fn stop_auto_publish(&self) -> Result<(), PublisherError> {
        {
            let mut state = lock(&self.state);
            if *state != PublisherState::Running {
                return Err(PublisherError::NotRunning);
            }
            *state = PublisherState::Stopping;
        }

        // Closing the queue ends the publish loop once it is drained, which in turn closes
        // the receipt queue.
        drop(lock(&self.queue).take());
        let tasks = lock(&self.tasks).take();
        if let Some((publish_loop, receipt_loop)) = tasks {
            if let Err(e) = publish_loop.await {
                error!(error = ?e, "The auto-publish loop panicked");
            }
            if let Err(e) = receipt_loop.await {
                error!(error = ?e, "The receipt loop panicked");
            }
        }

        *lock(&self.state) = PublisherState::Stopped;
        debug!("Auto-publish stopped");
        Ok(())
    }
}

impl PublisherCore {
    /// Run the middleware chain and the publishing, returning the number of attempts made.
    async fn publish(
        &self,
        message: Message,
        await_ack: bool,
    ) -> (Result<(), PublisherError>, u32) {
        let mut extensions = Extensions::new();
        let next = Next {
            channel_pool: &self.channel_pool,
            settings: &self.settings,
            await_ack,
            next_middleware: self.middleware_chain.as_slice(),
        };

        let outcome = next.run(message, &mut extensions).await;
        let attempts = extensions
            .get::<PublishAttempts>()
            .map(|attempts| attempts.0)
            .unwrap_or_default();
        (outcome, attempts)
    }
}

#[tracing::instrument(name = "auto_publish_loop", skip_all)]
async fn publish_loop(
    core: Arc<PublisherCore>,
    mut queue: mpsc::Receiver<Message>,
    receipts: mpsc::Sender<PublishReceipt>,
) {
    let await_ack = core.settings.publisher_confirms;
    while let Some(message) = queue.recv().await {
        let message = inject_amqp_properties(message);
        let (outcome, attempts) = core.publish(message.clone(), await_ack).await;
        let outcome = match outcome {
            Ok(()) => PublishOutcome::Published,
            Err(e) => {
                error!(
                    error = ?e,
                    message_id = ?message.message_id,
                    attempts,
                    "Failed to publish message"
                );
                PublishOutcome::Failed(e.to_string())
            }
        };
        let receipt = PublishReceipt {
            message_id: message.message_id.clone().unwrap_or_default(),
            message,
            outcome,
            attempts,
        };
        if receipts.send(receipt).await.is_err() {
            warn!("The receipt loop is gone, dropping receipt");
        }
    }
    debug!("Publisher queue drained");
}

#[tracing::instrument(name = "receipt_loop", skip_all)]
async fn receipt_loop(
    mut receipts: mpsc::Receiver<PublishReceipt>,
    receipt_handler: Arc<dyn ReceiptHandler>,
) {
    while let Some(receipt) = receipts.recv().await {
        receipt_handler.handle(receipt).await;
    }
}

/// Error returned when trying to publish a message using `Publisher`.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    GenericError(#[source] anyhow::Error),
    #[error("A middleware failed to process the message before publishing")]
    MiddlewareError(#[source] anyhow::Error),
    #[error("The timeout threshold was reached while trying to publish the message")]
    TimeoutError,
    #[error("The message could not be routed: {reply_code} {reply_text}")]
    UnroutableMessage { reply_code: u16, reply_text: String },
    #[error("The RabbitMq broker nacked the publishing of the message")]
    NegativeAck,
    #[error("Failed to get a channel from the pool")]
    Pool(#[from] crate::pool::Error),
    #[error("The auto-publish loop is not running")]
    NotRunning,
    #[error("The auto-publish loop is already running")]
    AlreadyRunning,
}

impl PublisherError {
    /// Whether another publishing attempt could succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::GenericError(_)
            | Self::TimeoutError
            | Self::UnroutableMessage { .. }
            | Self::NegativeAck => true,
            Self::Pool(e) => !matches!(e, crate::pool::Error::Closed),
            Self::MiddlewareError(_) | Self::NotRunning | Self::AlreadyRunning => false,
        }
    }
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder {
    channel_pool: ChannelPool,
    settings: PublisherSettings,
    middleware_chain: Vec<Arc<dyn PublisherMiddleware>>,
}

impl PublisherBuilder {
    fn new(channel_pool: ChannelPool) -> Self {
        Self {
            channel_pool,
            settings: PublisherSettings::default(),
            middleware_chain: vec![],
        }
    }

    #[must_use]
    pub fn settings(mut self, settings: PublisherSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Timeout applied to each attempt to publish a message.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.settings.publish_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// You can add middleware to inject logic before and after publishing a message.
    /// Middlewares are executed in the order they are registered: the first registered
    /// middleware executes first on the way in and last on the way out.
    ///
    /// Check out [`PublisherMiddleware`]'s documentation for more details.
    #[must_use]
    pub fn with_middleware<M: PublisherMiddleware + 'static>(self, middleware: M) -> Self {
        self.with_dyn_middleware(Arc::new(middleware))
    }

    /// Append dynamic middleware logic, see [`PublisherBuilder::with_middleware`].
    #[must_use]
    pub fn with_dyn_middleware(
        mut self,
        middleware: Arc<dyn PublisherMiddleware + 'static>,
    ) -> Self {
        self.middleware_chain.push(middleware);
        self
    }

    /// Append multiple dynamic middlewares, see [`PublisherBuilder::with_middleware`].
    #[must_use]
    pub fn with_middlewares<I>(mut self, middlewares: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn PublisherMiddleware + 'static>>,
    {
        self.middleware_chain.extend(middlewares);
        self
    }

    /// Compress payloads, see [`CompressionMiddleware`].
    ///
    /// Register it before [`PublisherBuilder::with_encryption`]: payloads are compressed,
    /// then encrypted.
    #[must_use]
    pub fn with_compression(self, compressor: Arc<dyn Compressor>) -> Self {
        self.with_middleware(CompressionMiddleware::new(compressor))
    }

    /// Encrypt payloads, see [`EncryptionMiddleware`].
    #[must_use]
    pub fn with_encryption(self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.with_middleware(EncryptionMiddleware::new(encryptor))
    }

    /// Finalise the builder and get an instance of [`Publisher`].
    pub fn build(self) -> Publisher {
        Publisher {
            core: Arc::new(PublisherCore {
                channel_pool: self.channel_pool,
                settings: self.settings,
                middleware_chain: self.middleware_chain,
            }),
            state: Mutex::new(PublisherState::Stopped),
            queue: Mutex::new(None),
            tasks: Mutex::new(None),
        }
    }
}

/// Inject the current timestamp and a message id, unless they are already set.
fn inject_amqp_properties(mut message: Message) -> Message {
    if message.timestamp.is_none() {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(now) => message.timestamp = Some(now.as_secs()),
            Err(_) => warn!("System time is before 1970"),
        }
    }
    if message.message_id.is_none() {
        message.message_id = Some(Uuid::new_v4().to_string());
    }
    message
}
