use crate::helpers::{broker_with_queue, eventually, get_consumer, get_publisher};
use carrot_flow::consumers::ConsumerError;
use carrot_flow::messages::Message;
use futures_util::StreamExt;
use std::collections::HashSet;
use std::time::Duration;

async fn publish_all(broker: &carrot_flow::amqp::InMemoryBroker, queue_name: &str, n: usize) {
    let publisher = get_publisher(broker).await;
    for i in 0..n {
        publisher
            .publish(Message::to_queue(queue_name, i.to_string()), true)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn a_message_is_settled_at_most_once() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    publish_all(&broker, &queue_name, 1).await;
    let consumer = get_consumer(&broker, &queue_name).await;
    consumer.start_consumer(false, false).await.unwrap();
    let mut messages = Box::pin(consumer.stream_until_consumer_stop());
    let received = messages.next().await.unwrap();

    // Act
    let acked = received.ack().await;
    let acked_again = received.ack().await;
    let nacked = received.nack(true).await;

    // Assert
    assert!(acked);
    assert!(!acked_again);
    assert!(!nacked);
    assert_eq!(broker.unacked_count(&queue_name), 0);
    assert_eq!(broker.queue_depth(&queue_name), 0);
    consumer.stop_consumer(false).await.unwrap();
}

#[tokio::test]
async fn rejected_messages_can_be_requeued() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    publish_all(&broker, &queue_name, 1).await;
    let consumer = get_consumer(&broker, &queue_name).await;
    consumer.start_consumer(false, false).await.unwrap();
    let mut messages = Box::pin(consumer.stream_until_consumer_stop());

    // Act
    let first = messages.next().await.unwrap();
    assert!(first.reject(true).await);
    let second = messages.next().await.unwrap();

    // Assert
    assert!(!first.redelivered());
    assert!(second.redelivered());
    assert_eq!(second.message.payload, first.message.payload);
    assert!(second.ack().await);
    consumer.stop_consumer(false).await.unwrap();
}

#[tokio::test]
async fn the_consumer_subscribes_again_after_a_channel_failure() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    publish_all(&broker, &queue_name, 1).await;
    let consumer = get_consumer(&broker, &queue_name).await;
    consumer.start_consumer(false, false).await.unwrap();
    let mut messages = Box::pin(consumer.stream_until_consumer_stop());
    let before_failure = messages.next().await.unwrap();

    // Act
    broker.fail_consumer_channels(&queue_name);
    let redelivered = messages.next().await.unwrap();
    publish_all(&broker, &queue_name, 1).await;
    let after_recovery = messages.next().await.unwrap();

    // Assert
    assert!(!before_failure.ack().await);
    assert!(redelivered.redelivered());
    assert_eq!(redelivered.message.payload, before_failure.message.payload);
    assert!(redelivered.ack().await);
    assert!(after_recovery.ack().await);
    assert!(consumer.is_running().await);
    consumer.stop_consumer(false).await.unwrap();
}

#[tokio::test]
async fn a_graceful_stop_lets_readers_drain_the_buffer() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    publish_all(&broker, &queue_name, 5).await;
    let consumer = get_consumer(&broker, &queue_name).await;
    consumer.start_consumer(false, false).await.unwrap();
    let mut messages = Box::pin(consumer.stream_until_consumer_stop());
    let mut received = vec![messages.next().await.unwrap()];

    // Act
    assert!(consumer.stop_consumer(false).await.unwrap());
    while let Some(message) = messages.next().await {
        received.push(message);
    }

    // Assert
    for message in &received {
        assert!(message.ack().await);
    }
    assert_eq!(received.len() + broker.queue_depth(&queue_name), 5);
    assert_eq!(broker.unacked_count(&queue_name), 0);
    assert!(!consumer.is_running().await);
}

#[tokio::test]
async fn an_immediate_stop_discards_the_buffer_and_hands_messages_back() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    publish_all(&broker, &queue_name, 5).await;
    let consumer = get_consumer(&broker, &queue_name).await;
    consumer.start_consumer(false, false).await.unwrap();
    let mut messages = Box::pin(consumer.stream_until_consumer_stop());
    let in_flight = messages.next().await.unwrap();

    // Act
    assert!(consumer.stop_consumer(true).await.unwrap());

    // Assert
    assert!(messages.next().await.is_none());
    assert!(!in_flight.ack().await);
    assert_eq!(broker.queue_depth(&queue_name), 5);
    assert_eq!(broker.unacked_count(&queue_name), 0);
}

#[tokio::test]
async fn a_fault_on_a_transient_channel_ends_the_consumer() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    let consumer = get_consumer(&broker, &queue_name).await;
    assert!(consumer.start_consumer(false, true).await.unwrap());

    // Act
    broker.fail_consumer_channels(&queue_name);

    // Assert
    tokio::time::timeout(Duration::from_secs(5), async {
        while consumer.is_running().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(consumer.start_consumer(false, true).await.unwrap());
    consumer.stop_consumer(true).await.unwrap();
}

#[tokio::test]
async fn starting_and_stopping_twice_is_a_no_op() {
    let (broker, queue_name) = broker_with_queue();
    let consumer = get_consumer(&broker, &queue_name).await;

    assert!(!consumer.stop_consumer(false).await.unwrap());
    assert!(consumer.start_consumer(false, false).await.unwrap());
    assert!(!consumer.start_consumer(false, false).await.unwrap());
    assert!(consumer.stop_consumer(false).await.unwrap());
    assert!(!consumer.stop_consumer(true).await.unwrap());
}

#[tokio::test]
async fn starting_fails_when_the_queue_does_not_exist() {
    let broker = carrot_flow::amqp::InMemoryBroker::new();
    let consumer = get_consumer(&broker, "missing").await;

    let outcome = consumer.start_consumer(false, false).await;

    assert!(matches!(outcome, Err(ConsumerError::Broker(_))));
    assert!(!consumer.is_running().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_share_the_messages_of_a_consumer() {
    // Arrange
    let (broker, queue_name) = broker_with_queue();
    let consumer = get_consumer(&broker, &queue_name).await;
    consumer.start_consumer(true, false).await.unwrap();
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let messages = consumer.stream_until_consumer_stop();
            tokio::spawn(async move {
                messages
                    .map(|received| received.message.payload)
                    .collect::<Vec<_>>()
                    .await
            })
        })
        .collect();

    // Act
    publish_all(&broker, &queue_name, 30).await;
    eventually(|| broker.queue_depth(&queue_name) == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    consumer.stop_consumer(false).await.unwrap();

    // Assert
    let mut payloads = vec![];
    for reader in readers {
        payloads.extend(reader.await.unwrap());
    }
    let distinct: HashSet<_> = payloads.iter().cloned().collect();
    assert_eq!(payloads.len(), 30);
    assert_eq!(distinct.len(), 30);
}
