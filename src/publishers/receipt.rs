use crate::messages::Message;
use tokio::sync::mpsc;
use tracing::warn;

/// How the publishing of a message ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// All attempts failed. It carries the error of the last attempt.
    Failed(String),
}

/// The record of a message going through the auto-publish loop.
///
/// Every message accepted by [`Publisher::queue_message`] yields exactly one receipt.
///
/// [`Publisher::queue_message`]: super::Publisher::queue_message
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub message_id: String,
    /// The message as it was queued, before middlewares transformed it.
    pub message: Message,
    pub outcome: PublishOutcome,
    /// Number of publishing attempts, retries included.
    pub attempts: u32,
}

impl PublishReceipt {
    pub fn is_success(&self) -> bool {
        self.outcome == PublishOutcome::Published
    }
}

/// Receives the [`PublishReceipt`]s of the auto-publish loop.
///
/// Receipts are handed over one at a time, in publishing order.
#[async_trait::async_trait]
pub trait ReceiptHandler: Send + Sync + 'static {
    async fn handle(&self, receipt: PublishReceipt);
}

/// Forward receipts into a channel.
#[async_trait::async_trait]
impl ReceiptHandler for mpsc::Sender<PublishReceipt> {
    async fn handle(&self, receipt: PublishReceipt) {
        if let Err(e) = self.send(receipt).await {
            warn!(
                message_id = %e.0.message_id,
                "The receiver of publish receipts has been dropped"
            );
        }
    }
}

/// Wrapper type to turn a closure into a [`ReceiptHandler`].
pub struct ClosureReceiptHandler<F>(pub F);

#[async_trait::async_trait]
impl<F> ReceiptHandler for ClosureReceiptHandler<F>
where
    F: Fn(PublishReceipt) + Send + Sync + 'static,
{
    async fn handle(&self, receipt: PublishReceipt) {
        (self.0)(receipt)
    }
}
