use crate::amqp::{Acknowledger, Delivery};
use crate::messages::Message;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// A message pulled from a queue by a [`Consumer`](super::Consumer).
///
/// The message must be settled with the broker exactly once, using [`ack`], [`nack`] or
/// [`reject`]: only the first call has an effect, the following ones return `false`.
/// Messages received in auto-ack mode are settled by the broker on delivery.
///
/// [`ack`]: ReceivedMessage::ack
/// [`nack`]: ReceivedMessage::nack
/// [`reject`]: ReceivedMessage::reject
pub struct ReceivedMessage {
    pub message: Message,
    delivery_tag: u64,
    redelivered: bool,
    consumer_name: String,
    acker: Option<Arc<dyn Acknowledger>>,
    settled: AtomicBool,
    completed: watch::Sender<bool>,
}

impl ReceivedMessage {
    pub(crate) fn new(delivery: Delivery, consumer_name: &str) -> Self {
        let (completed, _) = watch::channel(false);
        Self {
            message: delivery.message,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            consumer_name: consumer_name.to_owned(),
            acker: delivery.acker,
            settled: AtomicBool::new(false),
            completed,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker delivered this message before, to this or another consumer.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub fn is_auto_acked(&self) -> bool {
        self.acker.is_none()
    }

    pub fn is_settled(&self) -> bool {
        self.acker.is_none() || self.settled.load(Ordering::Acquire)
    }

    /// Positively acknowledge the message.
    ///
    /// It returns `false` if the message was auto-acked or already settled, or if the broker
    /// could not be reached (e.g. the channel is closed).
    pub async fn ack(&self) -> bool {
        let Some(acker) = self.settle_once() else {
            return false;
        };
        match acker.ack().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = ?e, delivery_tag = self.delivery_tag, "Failed to ack message");
                false
            }
        }
    }

    /// Negatively acknowledge the message. With `requeue`, the broker delivers it again.
    pub async fn nack(&self, requeue: bool) -> bool {
        let Some(acker) = self.settle_once() else {
            return false;
        };
        match acker.nack(requeue).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = ?e, delivery_tag = self.delivery_tag, "Failed to nack message");
                false
            }
        }
    }

    /// Reject the message. With `requeue`, the broker delivers it again.
    pub async fn reject(&self, requeue: bool) -> bool {
        let Some(acker) = self.settle_once() else {
            return false;
        };
        match acker.reject(requeue).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = ?e, delivery_tag = self.delivery_tag, "Failed to reject message");
                false
            }
        }
    }

    fn settle_once(&self) -> Option<&Arc<dyn Acknowledger>> {
        let acker = self.acker.as_ref()?;
        if self.settled.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(acker)
    }

    /// Signal that processing of the message is over. Calling it more than once is harmless.
    pub fn complete(&self) {
        self.completed.send_replace(true);
    }

    pub fn is_completed(&self) -> bool {
        *self.completed.borrow()
    }

    /// Resolves once [`complete`](ReceivedMessage::complete) has been called, or once the
    /// message has been dropped.
    pub fn completion(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut completed = self.completed.subscribe();
        async move {
            while !*completed.borrow() {
                if completed.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("message", &self.message)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("consumer_name", &self.consumer_name)
            .field("settled", &self.is_settled())
            .finish()
    }
}
