use carrot_flow::amqp::configuration::{ConsumerSettings, PoolSettings, PublisherSettings};
use carrot_flow::amqp::InMemoryBroker;
use carrot_flow::codecs::{Compressor, Encryptor, Serializer};
use carrot_flow::consumers::Consumer;
use carrot_flow::pool::ChannelPool;
use carrot_flow::publishers::Publisher;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub fn pool_settings(max_connections: usize, max_channels: usize) -> PoolSettings {
    PoolSettings {
        connection_name: "tests".into(),
        max_connections,
        max_channels,
        sleep_on_error_interval_ms: 10,
    }
}

pub async fn get_channel_pool(broker: &InMemoryBroker) -> ChannelPool {
    ChannelPool::connect(broker.clone(), &pool_settings(2, 10))
        .await
        .unwrap()
}

pub fn publisher_settings() -> PublisherSettings {
    PublisherSettings {
        publish_timeout_ms: 1000,
        retry_delay_ms: 5,
        ..PublisherSettings::default()
    }
}

pub async fn get_publisher(broker: &InMemoryBroker) -> Publisher {
    Publisher::builder(get_channel_pool(broker).await)
        .settings(publisher_settings())
        .build()
}

pub fn consumer_settings(queue_name: &str) -> ConsumerSettings {
    ConsumerSettings {
        prefetch_count: 10,
        buffer_capacity: 10,
        sleep_on_error_interval_ms: 10,
        ..ConsumerSettings::new(format!("{queue_name}-consumer"), queue_name)
    }
}

pub async fn get_consumer(broker: &InMemoryBroker, queue_name: &str) -> Arc<Consumer> {
    Arc::new(Consumer::new(
        get_channel_pool(broker).await,
        consumer_settings(queue_name),
    ))
}

/// A broker with a freshly declared queue, named randomly.
pub fn broker_with_queue() -> (InMemoryBroker, String) {
    let broker = InMemoryBroker::new();
    let queue_name = Uuid::new_v4().to_string();
    broker.declare_queue(&queue_name);
    (broker, queue_name)
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "The condition was not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, anyhow::Error> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, anyhow::Error> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Reverses the payload. Good enough to check that compression is undone.
pub struct ReverseCompressor;

impl Compressor for ReverseCompressor {
    fn name(&self) -> &str {
        "reverse"
    }

    fn compress(&self, payload: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
        Ok(payload.iter().rev().copied().collect())
    }

    fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
        self.compress(payload)
    }
}

pub struct XorEncryptor(pub u8);

impl Encryptor for XorEncryptor {
    fn name(&self) -> &str {
        "xor"
    }

    fn encrypt(&self, payload: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
        Ok(payload.iter().map(|b| b ^ self.0).collect())
    }

    fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
        self.encrypt(payload)
    }
}
