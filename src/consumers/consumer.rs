use crate::amqp::configuration::ConsumerSettings;
use crate::amqp::{BrokerError, DeliveryStream};
use crate::consumers::{ConsumerError, ReceivedMessage};
use crate::pool::{ChannelHost, ChannelPool, PooledChannel};
use futures_util::{stream, FutureExt, Stream, StreamExt};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pulls messages from a queue and hands them over to any number of readers.
///
/// Deliveries are forwarded, in the order the broker pushed them, into a bounded buffer
/// (`buffer_capacity`): readers consume it via [`Consumer::stream_until_consumer_stop`].
///
/// # Fault tolerance
///
/// When consuming on a pooled channel, a broken subscription is recovered transparently:
/// the channel is discarded, a new one is taken from the pool and the consumer subscribes
/// again. Readers are not affected. Messages that were in flight on the broken channel are
/// redelivered by the broker.
pub struct Consumer {
    channel_pool: ChannelPool,
    settings: ConsumerSettings,
    lifecycle: tokio::sync::Mutex<Option<RunningConsumer>>,
    buffer: Mutex<Option<Arc<Buffer>>>,
}

struct RunningConsumer {
    stop: watch::Sender<StopSignal>,
    task: JoinHandle<()>,
    buffer: Arc<Buffer>,
}

/// The buffer between the consume loop and the readers.
struct Buffer {
    receiver: tokio::sync::Mutex<mpsc::Receiver<ReceivedMessage>>,
    /// Set on immediate stop: readers must not see what is left in the buffer.
    discarded: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Running,
    Graceful,
    Immediate,
}

impl Consumer {
    pub fn new(channel_pool: ChannelPool, settings: ConsumerSettings) -> Self {
        Self {
            channel_pool,
            settings,
            lifecycle: tokio::sync::Mutex::new(None),
            buffer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.consumer_name
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle
            .lock()
            .await
            .as_ref()
            .map_or(false, |running| !running.task.is_finished())
    }

    /// Subscribe to the queue and start forwarding deliveries to the readers.
    ///
    /// It returns `false`, without doing anything, if the consumer is already running.
    /// Errors raised while acquiring the first channel or subscribing are returned: later
    /// faults are recovered by the consume loop.
    ///
    /// With `use_transient_channel`, the consumer opens a channel outside of the pool. A fault
    /// on such a channel ends the consumer.
    #[tracing::instrument(name = "consumer_start", skip(self), fields(consumer = %self.settings.consumer_name))]
    pub async fn start_consumer(
        &self,
        auto_ack: bool,
        use_transient_channel: bool,
    ) -> Result<bool, ConsumerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(running) = lifecycle.as_ref() {
            if !running.task.is_finished() {
                return Ok(false);
            }
        }

        let channel = if use_transient_channel {
            ConsumerChannel::Transient(self.channel_pool.get_transient_channel(false).await?)
        } else {
            ConsumerChannel::Pooled(self.channel_pool.get_channel().await?)
        };
        let consumer_tag = format!("{}-{}", self.settings.consumer_name, Uuid::new_v4());
        let deliveries = match subscribe(&channel, &self.settings, &consumer_tag, auto_ack).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                channel.release(&self.channel_pool, true).await;
                return Err(e.into());
            }
        };

        let (sender, receiver) = mpsc::channel(self.settings.buffer_capacity.max(1));
        let buffer = Arc::new(Buffer {
            receiver: tokio::sync::Mutex::new(receiver),
            discarded: AtomicBool::new(false),
        });
        let (stop, stop_signal) = watch::channel(StopSignal::Running);
        let consume_loop = ConsumeLoop {
            channel_pool: self.channel_pool.clone(),
            settings: self.settings.clone(),
            auto_ack,
            consumer_tag,
            sender,
            stop: stop_signal,
        };
        let task = tokio::spawn(consume_loop.run(channel, deliveries));

        *self.buffer.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&buffer));
        *lifecycle = Some(RunningConsumer { stop, task, buffer });
        info!(queue = %self.settings.queue_name, "Consumer started");
        Ok(true)
    }

    /// Stop the consumer. It returns `false` if the consumer is not running.
    ///
    /// A graceful stop cancels the subscription and lets readers drain the messages that are
    /// already buffered. An immediate stop closes the channel and discards the buffered
    /// messages: the broker delivers them again.
    #[tracing::instrument(name = "consumer_stop", skip(self), fields(consumer = %self.settings.consumer_name))]
    pub async fn stop_consumer(&self, immediate: bool) -> Result<bool, ConsumerError> {
        let Some(running) = self.lifecycle.lock().await.take() else {
            return Ok(false);
        };
        if immediate {
            running.buffer.discarded.store(true, Ordering::Release);
            running.stop.send_replace(StopSignal::Immediate);
        } else {
            running.stop.send_replace(StopSignal::Graceful);
        }
        if let Err(e) = running.task.await {
            error!(error = ?e, "The consume loop panicked");
        }
        if immediate {
            if let Ok(mut receiver) = running.buffer.receiver.try_lock() {
                receiver.close();
                while receiver.try_recv().is_ok() {}
            }
        }
        info!("Consumer stopped");
        Ok(true)
    }

    /// A stream over the messages received by the consumer.
    ///
    /// It ends once the consumer is stopped and the messages already buffered have been read.
    /// Many readers can share the same buffer, each message is yielded to one of them.
    /// It is empty if the consumer has not been started yet.
    pub fn stream_until_consumer_stop(
        &self,
    ) -> impl Stream<Item = ReceivedMessage> + Send + 'static {
        let buffer = self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stream::unfold(buffer, |buffer| async move {
            let buffer = buffer?;
            let message = {
                let mut receiver = buffer.receiver.lock().await;
                loop {
                    if buffer.discarded.load(Ordering::Acquire) {
                        break None;
                    }
                    match receiver.recv().await {
                        Some(message) if buffer.discarded.load(Ordering::Acquire) => drop(message),
                        message => break message,
                    }
                }
            };
            message.map(|message| (message, Some(buffer)))
        })
    }
}

/// The channel a consumer is subscribed on.
enum ConsumerChannel {
    Pooled(PooledChannel),
    Transient(ChannelHost),
}

impl Deref for ConsumerChannel {
    type Target = ChannelHost;

    fn deref(&self) -> &ChannelHost {
        match self {
            Self::Pooled(channel) => channel,
            Self::Transient(channel) => channel,
        }
    }
}

impl ConsumerChannel {
    /// Pooled channels go back to the pool, transient channels are closed.
    async fn release(self, channel_pool: &ChannelPool, poisoned: bool) {
        match self {
            Self::Pooled(channel) => channel_pool.return_channel(channel, poisoned).await,
            Self::Transient(channel) => {
                if let Err(e) = channel.close().await {
                    debug!(error = ?e, "Failed to close transient channel");
                }
            }
        }
    }
}

async fn subscribe(
    channel: &ChannelHost,
    settings: &ConsumerSettings,
    consumer_tag: &str,
    auto_ack: bool,
) -> Result<DeliveryStream, BrokerError> {
    channel.basic_qos(settings.prefetch_count).await?;
    channel
        .basic_consume(&settings.queue_name, consumer_tag, auto_ack)
        .await
}

enum LoopEvent {
    Stop,
    Delivery(crate::amqp::Delivery),
    Fault(Option<BrokerError>),
}

struct ConsumeLoop {
    channel_pool: ChannelPool,
    settings: ConsumerSettings,
    auto_ack: bool,
    consumer_tag: String,
    sender: mpsc::Sender<ReceivedMessage>,
    stop: watch::Receiver<StopSignal>,
}

impl ConsumeLoop {
    #[tracing::instrument(name = "consume_loop", skip_all, fields(consumer = %self.settings.consumer_name))]
    async fn run(mut self, mut channel: ConsumerChannel, mut deliveries: DeliveryStream) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.changed() => LoopEvent::Stop,
                delivery = deliveries.next() => match delivery {
                    Some(Ok(delivery)) => LoopEvent::Delivery(delivery),
                    Some(Err(e)) => LoopEvent::Fault(Some(e)),
                    None => LoopEvent::Fault(None),
                },
            };
            match event {
                LoopEvent::Stop => break,
                LoopEvent::Delivery(delivery) => {
                    let message = ReceivedMessage::new(delivery, &self.settings.consumer_name);
                    let permit = tokio::select! {
                        biased;
                        _ = self.stop.changed() => None,
                        permit = self.sender.reserve() => permit.ok(),
                    };
                    match permit {
                        Some(permit) => permit.send(message),
                        None => {
                            // Hand the message back to the broker, the channel outlives the loop
                            // on graceful stops.
                            message.nack(true).await;
                            break;
                        }
                    }
                }
                LoopEvent::Fault(e) => {
                    if let ConsumerChannel::Transient(_) = channel {
                        error!(error = ?e, "The transient channel of the consumer failed");
                        channel.release(&self.channel_pool, true).await;
                        return;
                    }
                    warn!(
                        error = ?e,
                        "The subscription of the consumer broke, subscribing again in {:?}",
                        self.settings.sleep_on_error_interval()
                    );
                    channel.release(&self.channel_pool, true).await;
                    match self.resubscribe().await {
                        Some((new_channel, new_deliveries)) => {
                            channel = new_channel;
                            deliveries = new_deliveries;
                        }
                        None => return,
                    }
                }
            }
        }

        let signal = *self.stop.borrow();
        match signal {
            StopSignal::Immediate => channel.release(&self.channel_pool, true).await,
            StopSignal::Graceful | StopSignal::Running => {
                if let Err(e) = channel.basic_cancel(&self.consumer_tag).await {
                    warn!(error = ?e, "Failed to cancel the subscription");
                }
                // Deliveries already pushed by the broker but not forwarded go back to the queue.
                // Auto-acked ones cannot: they are buffered if there is room left.
                while let Some(Some(Ok(delivery))) = deliveries.next().now_or_never() {
                    match delivery.acker.clone() {
                        Some(acker) => {
                            if let Err(e) = acker.nack(true).await {
                                debug!(error = ?e, "Failed to requeue delivery");
                            }
                        }
                        None => {
                            let message =
                                ReceivedMessage::new(delivery, &self.settings.consumer_name);
                            if self.sender.try_send(message).is_err() {
                                warn!("The buffer is full, dropping an auto-acked delivery");
                            }
                        }
                    }
                }
                channel.release(&self.channel_pool, false).await;
            }
        }
    }

    /// Take a new channel from the pool and subscribe again, until it works.
    ///
    /// It gives up, returning `None`, if the consumer is stopped or the pool shut down.
    async fn resubscribe(&mut self) -> Option<(ConsumerChannel, DeliveryStream)> {
        loop {
            let sleep = tokio::time::sleep(self.settings.sleep_on_error_interval());
            tokio::select! {
                biased;
                _ = self.stop.changed() => return None,
                _ = sleep => {}
            }

            let channel = tokio::select! {
                biased;
                _ = self.stop.changed() => return None,
                channel = self.channel_pool.get_channel() => channel,
            };
            let channel = match channel {
                Ok(channel) => ConsumerChannel::Pooled(channel),
                Err(crate::pool::Error::Closed) => {
                    error!("The channel pool has been shut down, the consumer exits");
                    return None;
                }
                Err(e) => {
                    warn!(error = ?e, "Failed to get a channel for the consumer");
                    continue;
                }
            };
            match subscribe(&channel, &self.settings, &self.consumer_tag, self.auto_ack).await {
                Ok(deliveries) => {
                    info!(channel_id = channel.id(), "Consumer subscribed again");
                    return Some((channel, deliveries));
                }
                Err(e) => {
                    warn!(error = ?e, "Failed to subscribe again");
                    channel.release(&self.channel_pool, true).await;
                }
            }
        }
    }
}
