use crate::helpers::pool_settings;
use carrot_flow::amqp::InMemoryBroker;
use carrot_flow::pool::{ChannelPool, ConnectionPool, Error};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_borrowers_never_exceed_the_pool_size_nor_share_a_channel() {
    // Arrange
    let broker = InMemoryBroker::new();
    let pool = ChannelPool::connect(broker.clone(), &pool_settings(2, 4))
        .await
        .unwrap();
    let in_use = Arc::new(Mutex::new(HashSet::new()));
    let outstanding = Arc::new(AtomicUsize::new(0));
    let max_outstanding = Arc::new(AtomicUsize::new(0));

    // Act
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            let in_use = in_use.clone();
            let outstanding = outstanding.clone();
            let max_outstanding = max_outstanding.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    let channel = pool.get_channel().await.unwrap();
                    let id = channel.id();
                    assert!(
                        in_use.lock().unwrap().insert(id),
                        "Channel {id} was lent twice"
                    );
                    let current = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                    max_outstanding.fetch_max(current, Ordering::SeqCst);

                    tokio::task::yield_now().await;

                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    in_use.lock().unwrap().remove(&id);
                    pool.return_channel(channel, false).await;
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    // Assert
    assert!(max_outstanding.load(Ordering::SeqCst) <= 4);
    assert!(pool.channel_status().size <= 4);
    assert_eq!(broker.open_connections(), 2);
    assert!(broker.open_channels() <= 4);
}

#[tokio::test]
async fn a_poisoned_channel_is_never_lent_again() {
    // Arrange
    let pool = ChannelPool::connect(InMemoryBroker::new(), &pool_settings(1, 2))
        .await
        .unwrap();
    let channel = pool.get_channel().await.unwrap();
    let poisoned_id = channel.id();

    // Act
    pool.return_channel(channel, true).await;

    // Assert
    for _ in 0..20 {
        let first = pool.get_channel().await.unwrap();
        let second = pool.get_channel().await.unwrap();
        assert_ne!(first.id(), poisoned_id);
        assert_ne!(second.id(), poisoned_id);
        pool.return_channel(first, false).await;
        pool.return_channel(second, false).await;
    }
}

#[tokio::test]
async fn an_unhealthy_connection_is_skipped_until_it_recovers() {
    // Arrange
    let broker = InMemoryBroker::new();
    let pool = ConnectionPool::new(broker.clone(), &pool_settings(3, 1))
        .await
        .unwrap();
    broker.set_connection_healthy("tests:1", false);

    // Act
    let first = pool.get_connection().await.unwrap();
    let second = pool.get_connection().await.unwrap();
    let pending = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get_connection().await.map(|c| c.id()) }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let lent_while_unhealthy = pending.is_finished();
    broker.set_connection_healthy("tests:1", true);

    // Assert
    assert_eq!(
        HashSet::from([first.id(), second.id()]),
        HashSet::from([2, 3])
    );
    assert!(!lent_while_unhealthy);
    assert_eq!(pending.await.unwrap().unwrap(), 1);
    assert_eq!(broker.open_connections(), 3);
}

#[tokio::test]
async fn a_recovered_connection_is_lent_again() {
    // Arrange
    let broker = InMemoryBroker::new();
    let pool = ConnectionPool::new(broker.clone(), &pool_settings(3, 1))
        .await
        .unwrap();
    broker.set_connection_healthy("tests:1", false);
    let connection = pool.get_connection().await.unwrap();
    assert_ne!(connection.id(), 1);
    pool.return_connection(connection);

    // Act
    broker.set_connection_healthy("tests:1", true);
    let connections = vec![
        pool.get_connection().await.unwrap(),
        pool.get_connection().await.unwrap(),
        pool.get_connection().await.unwrap(),
    ];

    // Assert
    let ids: HashSet<u64> = connections.iter().map(|c| c.id()).collect();
    assert_eq!(ids, HashSet::from([1, 2, 3]));
    assert_eq!(broker.open_connections(), 3);
    assert_eq!(pool.status().size, 3);
}

#[tokio::test]
async fn a_closed_connection_is_replaced() {
    // Arrange
    let broker = InMemoryBroker::new();
    let pool = ConnectionPool::new(broker.clone(), &pool_settings(2, 1))
        .await
        .unwrap();

    // Act
    broker.fail_connection("tests:1");
    let connections = vec![
        pool.get_connection().await.unwrap(),
        pool.get_connection().await.unwrap(),
    ];

    // Assert
    let ids: HashSet<u64> = connections.iter().map(|c| c.id()).collect();
    assert_eq!(ids, HashSet::from([2, 3]));
    assert!(connections.iter().all(|c| c.name() != "tests:1"));
    assert_eq!(broker.open_connections(), 2);
}

#[tokio::test]
async fn building_a_pool_fails_fast_when_the_broker_is_unreachable() {
    let broker = InMemoryBroker::new();
    broker.refuse_connections(true);

    let outcome = ChannelPool::connect(broker.clone(), &pool_settings(2, 4)).await;

    assert!(matches!(outcome, Err(Error::Broker(_))));
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn empty_pools_are_rejected() {
    let broker = InMemoryBroker::new();

    let no_connections = ChannelPool::connect(broker.clone(), &pool_settings(0, 4)).await;
    let no_channels = ChannelPool::connect(broker, &pool_settings(1, 0)).await;

    assert!(matches!(no_connections, Err(Error::Other(_))));
    assert!(matches!(no_channels, Err(Error::Other(_))));
}

#[tokio::test]
async fn channels_are_opened_again_once_the_broker_is_back() {
    // Arrange
    let broker = InMemoryBroker::new();
    let pool = ChannelPool::connect(broker.clone(), &pool_settings(1, 2))
        .await
        .unwrap();
    broker.fail_connection("tests:1");
    broker.refuse_connections(true);

    // Act
    let pending = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get_ack_channel().await.map(|c| c.connection_id()) }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());
    broker.refuse_connections(false);

    // Assert
    // Refused attempts use up connection ids as well.
    assert_ne!(pending.await.unwrap().unwrap(), 1);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test]
async fn shutdown_closes_everything_and_stops_lending() {
    // Arrange
    let broker = InMemoryBroker::new();
    let pool = ChannelPool::connect(broker.clone(), &pool_settings(2, 4))
        .await
        .unwrap();
    let idle = pool.get_channel().await.unwrap();
    let borrowed = pool.get_ack_channel().await.unwrap();
    pool.return_channel(idle, false).await;

    // Act
    pool.shutdown().await;

    // Assert
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_channels(), 0);
    assert!(!borrowed.is_healthy());
    assert!(matches!(pool.get_channel().await, Err(Error::Closed)));
    assert!(matches!(
        pool.connection_pool().get_connection().await,
        Err(Error::Closed)
    ));
}
