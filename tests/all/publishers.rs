use crate::helpers::{
    broker_with_queue, get_channel_pool, get_consumer, get_publisher, publisher_settings,
    ReverseCompressor, XorEncryptor,
};
use carrot_flow::amqp::configuration::PublisherSettings;
use carrot_flow::messages::{Message, COMPRESSED_MARKER, ENCRYPTED_MARKER};
use carrot_flow::publishers::{
    ClosureReceiptHandler, Next, PublishAttempts, PublishOutcome, PublishReceipt, Publisher,
    PublisherError, PublisherMiddleware, PublisherState,
};
use fake::{Fake, Faker};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use task_local_extensions::Extensions;
use tokio::sync::mpsc;

async fn drain(mut receipts: mpsc::Receiver<PublishReceipt>) -> Vec<PublishReceipt> {
    let mut drained = vec![];
    while let Some(receipt) = receipts.recv().await {
        drained.push(receipt);
    }
    drained
}

#[tokio::test]
async fn every_queued_message_yields_a_receipt_in_order() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    let publisher = get_publisher(&broker).await;
    let (sender, receiver) = mpsc::channel(100);
    publisher.start_auto_publish(Arc::new(sender)).await.unwrap();
    let n_messages = (5..30usize).fake::<usize>();

    // Act
    let mut message_ids = vec![];
    for i in 0..n_messages {
        let message_id = format!("message-{i}");
        message_ids.push(message_id.clone());
        publisher
            .queue_message(Message::to_queue(&queue_name, "payload").with_message_id(message_id))
            .await
            .unwrap();
    }
    publisher.stop_auto_publish().await.unwrap();

    // Assert
    let receipts = drain(receiver).await;
    assert_eq!(receipts.len(), n_messages);
    assert!(receipts.iter().all(|r| r.is_success() && r.attempts == 1));
    let received_ids: Vec<String> = receipts.into_iter().map(|r| r.message_id).collect();
    assert_eq!(received_ids, message_ids);
    assert_eq!(broker.queue_depth(&queue_name), n_messages);
}

#[tokio::test]
async fn negative_acks_are_retried() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    let publisher = get_publisher(&broker).await;
    let (sender, receiver) = mpsc::channel(10);
    publisher.start_auto_publish(Arc::new(sender)).await.unwrap();
    broker.nack_next_publishes(2);

    // Act
    publisher
        .queue_message(Message::to_queue(&queue_name, "payload"))
        .await
        .unwrap();
    publisher.stop_auto_publish().await.unwrap();

    // Assert
    let receipts = drain(receiver).await;
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].outcome, PublishOutcome::Published);
    assert_eq!(receipts[0].attempts, 3);
    assert_eq!(broker.queue_depth(&queue_name), 1);
}

#[tokio::test]
async fn a_failed_receipt_is_emitted_once_retries_are_exhausted() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    let publisher = Publisher::builder(get_channel_pool(&broker).await)
        .settings(PublisherSettings {
            max_retries: 2,
            ..publisher_settings()
        })
        .build();
    let failures = Arc::new(Mutex::new(vec![]));
    let handler = ClosureReceiptHandler({
        let failures = failures.clone();
        move |receipt: PublishReceipt| {
            if !receipt.is_success() {
                failures.lock().unwrap().push(receipt);
            }
        }
    });
    publisher.start_auto_publish(Arc::new(handler)).await.unwrap();
    broker.nack_next_publishes(100);

    // Act
    publisher
        .queue_message(Message::to_queue(&queue_name, "payload"))
        .await
        .unwrap();
    publisher.stop_auto_publish().await.unwrap();

    // Assert
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].attempts, 3);
    assert!(matches!(&failures[0].outcome, PublishOutcome::Failed(e) if e.contains("nacked")));
    assert_eq!(broker.queue_depth(&queue_name), 0);
}

#[tokio::test]
async fn unconfirmed_publishes_yield_failed_receipts_after_the_timeout() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    let settings = PublisherSettings {
        publish_timeout_ms: 30,
        max_retries: 2,
        ..publisher_settings()
    };
    let publisher = Publisher::builder(get_channel_pool(&broker).await)
        .settings(settings.clone())
        .build();
    let (sender, receiver) = mpsc::channel(100);
    publisher.start_auto_publish(Arc::new(sender)).await.unwrap();
    let n_messages = (2..6usize).fake::<usize>();
    let attempts_per_message = settings.max_retries as usize + 1;
    broker.withhold_next_confirms(n_messages * attempts_per_message);

    // Act
    for _ in 0..n_messages {
        publisher
            .queue_message(Message::to_queue(&queue_name, "payload"))
            .await
            .unwrap();
    }
    publisher.stop_auto_publish().await.unwrap();

    // Assert
    let receipts = drain(receiver).await;
    assert_eq!(receipts.len(), n_messages);
    for receipt in &receipts {
        assert_eq!(receipt.attempts, settings.max_retries + 1);
        assert!(
            matches!(&receipt.outcome, PublishOutcome::Failed(e) if e.contains("timeout")),
            "Unexpected outcome {:?}",
            receipt.outcome
        );
    }
    assert_eq!(broker.queue_depth(&queue_name), 0);
    // Every channel left waiting for a confirmation was discarded.
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn a_publish_that_timed_out_is_retried_on_a_fresh_channel() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    let pool = get_channel_pool(&broker).await;
    let publisher = Publisher::builder(pool.clone())
        .settings(PublisherSettings {
            publish_timeout_ms: 30,
            ..publisher_settings()
        })
        .build();
    let channel = pool.get_ack_channel().await.unwrap();
    let first_channel_id = channel.id();
    pool.return_channel(channel, false).await;
    broker.withhold_next_confirms(1);

    // Act
    let outcome = publisher
        .publish(Message::to_queue(&queue_name, "payload"), true)
        .await;

    // Assert
    assert!(outcome.is_ok());
    assert_eq!(broker.queue_depth(&queue_name), 1);
    let channel = pool.get_ack_channel().await.unwrap();
    assert_ne!(channel.id(), first_channel_id);
    assert_eq!(pool.ack_channel_status().size, 1);
}

#[tokio::test]
async fn unroutable_messages_are_reported_when_mandatory() {
    // Arrange
    let broker = carrot_flow::amqp::InMemoryBroker::new();
    let publisher = Publisher::builder(get_channel_pool(&broker).await)
        .settings(PublisherSettings {
            mandatory: true,
            max_retries: 0,
            ..publisher_settings()
        })
        .build();

    // Act
    let outcome = publisher
        .publish(Message::to_queue("nowhere", "payload"), true)
        .await;

    // Assert
    match outcome {
        Err(PublisherError::UnroutableMessage { reply_code, .. }) => assert_eq!(reply_code, 312),
        other => panic!("Expected an unroutable message error, got {other:?}"),
    }
}

#[tokio::test]
async fn unroutable_messages_are_dropped_silently_without_confirms() {
    let broker = carrot_flow::amqp::InMemoryBroker::new();
    let publisher = get_publisher(&broker).await;

    let outcome = publisher
        .publish(Message::to_queue("nowhere", "payload"), false)
        .await;

    assert!(outcome.is_ok());
}

#[tokio::test]
async fn published_messages_are_consumed_byte_for_byte() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    let publisher = get_publisher(&broker).await;
    let consumer = get_consumer(&broker, &queue_name).await;
    consumer.start_consumer(false, false).await.unwrap();
    let payload: Vec<u8> = Faker.fake();
    let header_value: String = Faker.fake();
    let message = Message::to_queue(&queue_name, payload.clone())
        .with_correlation_id("correlation")
        .with_content_type("application/octet-stream")
        .with_metadata("x-custom", header_value.clone());

    // Act
    publisher.publish(message, true).await.unwrap();
    let mut messages = Box::pin(consumer.stream_until_consumer_stop());
    let received = messages.next().await.unwrap();

    // Assert
    assert_eq!(received.message.payload, payload);
    assert_eq!(received.message.routing_key, queue_name);
    assert_eq!(
        received.message.metadata.get("x-custom"),
        Some(&header_value)
    );
    assert_eq!(
        received.message.correlation_id.as_deref(),
        Some("correlation")
    );
    assert!(received.message.message_id.is_some());
    assert!(received.message.timestamp.is_some());
    assert!(received.ack().await);
    consumer.stop_consumer(false).await.unwrap();
}

#[tokio::test]
async fn compression_and_encryption_are_recorded_in_the_metadata() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    let publisher = Publisher::builder(get_channel_pool(&broker).await)
        .settings(publisher_settings())
        .with_compression(Arc::new(ReverseCompressor))
        .with_encryption(Arc::new(XorEncryptor(42)))
        .build();
    let consumer = get_consumer(&broker, &queue_name).await;
    consumer.start_consumer(true, false).await.unwrap();

    // Act
    publisher
        .publish(Message::to_queue(&queue_name, vec![1, 2, 3]), true)
        .await
        .unwrap();
    let mut messages = Box::pin(consumer.stream_until_consumer_stop());
    let received = messages.next().await.unwrap();

    // Assert
    assert_eq!(received.message.payload, vec![3 ^ 42, 2 ^ 42, 1 ^ 42]);
    assert_eq!(received.message.compressed_with(), Some("reverse"));
    assert_eq!(received.message.encrypted_with(), Some("xor"));
    assert!(received.message.metadata.contains_key(COMPRESSED_MARKER));
    assert!(received.message.metadata.contains_key(ENCRYPTED_MARKER));
    consumer.stop_consumer(true).await.unwrap();
}

struct CountingMiddleware {
    calls: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl PublisherMiddleware for CountingMiddleware {
    async fn handle(
        &self,
        message: Message,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<(), PublisherError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = next.run(message, extensions).await;
        if let Some(attempts) = extensions.get::<PublishAttempts>() {
            self.attempts.store(attempts.0, Ordering::SeqCst);
        }
        outcome
    }
}

#[tokio::test]
async fn middlewares_run_once_per_message_and_see_the_attempts() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    let calls = Arc::new(AtomicU32::new(0));
    let attempts = Arc::new(AtomicU32::new(0));
    let publisher = Publisher::builder(get_channel_pool(&broker).await)
        .settings(publisher_settings())
        .with_middleware(CountingMiddleware {
            calls: calls.clone(),
            attempts: attempts.clone(),
        })
        .build();
    broker.nack_next_publishes(1);

    // Act
    publisher
        .publish(Message::to_queue(&queue_name, "payload"), true)
        .await
        .unwrap();

    // Assert
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

struct FailingMiddleware;

#[async_trait::async_trait]
impl PublisherMiddleware for FailingMiddleware {
    async fn handle(
        &self,
        _message: Message,
        _extensions: &mut Extensions,
        _next: Next<'_>,
    ) -> Result<(), PublisherError> {
        Err(PublisherError::MiddlewareError(anyhow::anyhow!(
            "Refusing to publish"
        )))
    }
}

#[tokio::test]
async fn a_failing_middleware_prevents_publishing() {
    let (broker, queue_name) = broker_with_queue();
    let publisher = Publisher::builder(get_channel_pool(&broker).await)
        .with_middleware(FailingMiddleware)
        .build();

    let outcome = publisher
        .publish(Message::to_queue(&queue_name, "payload"), true)
        .await;

    assert!(matches!(outcome, Err(PublisherError::MiddlewareError(_))));
    assert_eq!(broker.queue_depth(&queue_name), 0);
}

#[tokio::test]
async fn the_auto_publish_lifecycle_is_enforced() {
    // Arrange
    let broker = carrot_flow::amqp::InMemoryBroker::new();
    let publisher = get_publisher(&broker).await;
    let (sender, _receiver) = mpsc::channel(10);
    let handler: Arc<mpsc::Sender<PublishReceipt>> = Arc::new(sender);

    // Act & Assert
    assert_eq!(publisher.state(), PublisherState::Stopped);
    assert!(matches!(
        publisher
            .queue_message(Message::to_queue("orders", "payload"))
            .await,
        Err(PublisherError::NotRunning)
    ));
    assert!(matches!(
        publisher.stop_auto_publish().await,
        Err(PublisherError::NotRunning)
    ));

    publisher.start_auto_publish(handler.clone()).await.unwrap();
    assert_eq!(publisher.state(), PublisherState::Running);
    assert!(matches!(
        publisher.start_auto_publish(handler.clone()).await,
        Err(PublisherError::AlreadyRunning)
    ));

    publisher.stop_auto_publish().await.unwrap();
    assert_eq!(publisher.state(), PublisherState::Stopped);
    publisher.start_auto_publish(handler).await.unwrap();
    publisher.stop_auto_publish().await.unwrap();
}
