//! An in-process broker implementing the [`transport`](super::transport) interfaces.
//!
//! It follows the AMQP semantics the rest of the crate relies on (default exchange routing,
//! bindings, prefetch, acknowledgements, redelivery of unacked messages when a channel goes
//! away, publisher confirms) and exposes knobs to inject faults: unhealthy connections,
//! refused connections, broken channels and negative publisher confirms.
//!
//! It is meant for tests and local runs, it does not persist anything.
use crate::amqp::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, Confirmation,
    Delivery, DeliveryStream, PendingConfirmation,
};
use crate::messages::Message;
use futures_util::{future, stream, FutureExt, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// A broker living in the memory of the current process.
///
/// Cloning is cheap: all clones share the same queues.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    /// `(exchange, routing key)` -> bound queues.
    bindings: HashMap<(String, String), Vec<String>>,
    /// Open connections. Records are dropped when closed.
    connections: HashMap<u64, ConnectionRecord>,
    /// Open channels. Records are dropped when closed.
    channels: HashMap<u64, ChannelRecord>,
    unhealthy_connections: HashSet<String>,
    refuse_connections: bool,
    nack_next_publishes: usize,
    withhold_next_confirms: usize,
    next_connection_id: u64,
    next_channel_id: u64,
    next_delivery_tag: u64,
}

struct ConnectionRecord {
    name: String,
}

struct ChannelRecord {
    connection_id: u64,
    confirms: bool,
    prefetch_count: u16,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<(Message, bool)>,
    subscriptions: Vec<Subscription>,
    unacked: HashMap<u64, Unacked>,
    next_subscription: usize,
}

/// `(delivery tag, redelivered, message, auto ack)` pushed to a subscriber.
type DeliveryItem = (u64, bool, Message, bool);

struct Subscription {
    consumer_tag: String,
    channel_id: u64,
    auto_ack: bool,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<DeliveryItem, BrokerError>>,
}

struct Unacked {
    message: Message,
    channel_id: u64,
    consumer_tag: String,
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a queue. Declaring an existing queue is a no-op.
    pub fn declare_queue(&self, queue_name: &str) {
        lock(&self.state)
            .queues
            .entry(queue_name.to_owned())
            .or_default();
    }

    /// Bind `queue_name` to `exchange` for messages published with `routing_key`.
    pub fn bind_queue(&self, queue_name: &str, exchange: &str, routing_key: &str) {
        let mut state = lock(&self.state);
        state.queues.entry(queue_name.to_owned()).or_default();
        state
            .bindings
            .entry((exchange.to_owned(), routing_key.to_owned()))
            .or_default()
            .push(queue_name.to_owned());
    }

    /// Number of messages waiting to be delivered.
    pub fn queue_depth(&self, queue_name: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue_name)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }

    /// Number of messages delivered and not yet acknowledged.
    pub fn unacked_count(&self, queue_name: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue_name)
            .map(|q| q.unacked.len())
            .unwrap_or_default()
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn open_channels(&self) -> usize {
        lock(&self.state).channels.len()
    }

    /// Refuse (or accept again) new connections, as a broker that is down would.
    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.state).refuse_connections = refuse;
    }

    /// Make the connection named `connection_name` report itself as (un)healthy.
    pub fn set_connection_healthy(&self, connection_name: &str, healthy: bool) {
        let mut state = lock(&self.state);
        if healthy {
            state.unhealthy_connections.remove(connection_name);
        } else {
            state
                .unhealthy_connections
                .insert(connection_name.to_owned());
        }
    }

    /// Negatively confirm the next `count` publishes.
    pub fn nack_next_publishes(&self, count: usize) {
        lock(&self.state).nack_next_publishes = count;
    }

    /// Drop the next `count` publishes on channels with publisher confirms: they are neither
    /// routed nor ever confirmed.
    pub fn withhold_next_confirms(&self, count: usize) {
        lock(&self.state).withhold_next_confirms = count;
    }

    /// Abruptly close the connection named `connection_name` and all its channels.
    pub fn fail_connection(&self, connection_name: &str) {
        let mut state = lock(&self.state);
        let ids: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| c.name == connection_name)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            close_connection(&mut state, id, true);
        }
    }

    /// Abruptly close every channel holding a subscription on `queue_name`.
    ///
    /// Subscribers observe an error on their delivery stream.
    pub fn fail_consumer_channels(&self, queue_name: &str) {
        let mut state = lock(&self.state);
        let channel_ids: HashSet<u64> = state
            .queues
            .get(queue_name)
            .map(|q| q.subscriptions.iter().map(|s| s.channel_id).collect())
            .unwrap_or_default();
        for channel_id in channel_ids {
            close_channel(&mut state, channel_id, true);
        }
    }
}

#[async_trait::async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(
        &self,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut state = lock(&self.state);
        if state.refuse_connections {
            return Err(BrokerError::Protocol(anyhow::anyhow!(
                "Connection refused by the broker"
            )));
        }
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.insert(
            id,
            ConnectionRecord {
                name: connection_name.to_owned(),
            },
        );
        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
            id,
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
}

#[async_trait::async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        let state = lock(&self.state);
        match state.connections.get(&self.id) {
            Some(record) => !state.unhealthy_connections.contains(&record.name),
            None => false,
        }
    }

    fn is_closed(&self) -> bool {
        !lock(&self.state).connections.contains_key(&self.id)
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let mut state = lock(&self.state);
        if !state.connections.contains_key(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        state.channels.insert(
            id,
            ChannelRecord {
                connection_id: self.id,
                confirms: false,
                prefetch_count: 0,
            },
        );
        Ok(Box::new(MemoryChannel {
            state: Arc::clone(&self.state),
            id,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        close_connection(&mut lock(&self.state), self.id, false);
        Ok(())
    }
}

struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<(), BrokerError> {
        if state.channels.contains_key(&self.id) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.ensure_open(&lock(&self.state)).is_ok()
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        self.ensure_open(&state)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.confirms = true;
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        self.ensure_open(&state)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch_count = prefetch_count;
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        message: &Message,
        mandatory: bool,
    ) -> Result<PendingConfirmation, BrokerError> {
        let mut state = lock(&self.state);
        self.ensure_open(&state)?;
        let confirms = state.channels.get(&self.id).map_or(false, |c| c.confirms);

        let destinations: Vec<String> = if message.exchange.is_empty() {
            if state.queues.contains_key(&message.routing_key) {
                vec![message.routing_key.clone()]
            } else {
                vec![]
            }
        } else {
            state
                .bindings
                .get(&(message.exchange.clone(), message.routing_key.clone()))
                .cloned()
                .unwrap_or_default()
        };

        if confirms && state.withhold_next_confirms > 0 {
            state.withhold_next_confirms -= 1;
            return Ok(future::pending::<Result<Confirmation, BrokerError>>().boxed());
        }
        let confirmation = if confirms && state.nack_next_publishes > 0 {
            state.nack_next_publishes -= 1;
            Confirmation::Nack
        } else if destinations.is_empty() && mandatory {
            Confirmation::Returned {
                reply_code: 312,
                reply_text: "NO_ROUTE".into(),
            }
        } else {
            for queue_name in &destinations {
                if let Some(queue) = state.queues.get_mut(queue_name) {
                    queue.ready.push_back((message.clone(), false));
                }
                dispatch(&mut state, queue_name);
            }
            if confirms {
                Confirmation::Ack
            } else {
                Confirmation::NotRequested
            }
        };
        Ok(future::ready(Ok(confirmation)).boxed())
    }

    async fn basic_consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = lock(&self.state);
        self.ensure_open(&state)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = state.queues.get_mut(queue_name).ok_or_else(|| {
            BrokerError::Protocol(anyhow::anyhow!("NOT_FOUND - no queue '{queue_name}'"))
        })?;
        queue.subscriptions.push(Subscription {
            consumer_tag: consumer_tag.to_owned(),
            channel_id: self.id,
            auto_ack,
            in_flight: 0,
            sender,
        });
        dispatch(&mut state, queue_name);

        let state = Arc::clone(&self.state);
        let queue_name = queue_name.to_owned();
        let channel_id = self.id;
        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .map(move |item| {
            item.map(|(tag, redelivered, message, auto_ack)| Delivery {
                delivery_tag: tag,
                redelivered,
                message,
                acker: (!auto_ack).then(|| {
                    Arc::new(MemoryAcker {
                        state: Arc::clone(&state),
                        queue_name: queue_name.clone(),
                        channel_id,
                        delivery_tag: tag,
                    }) as Arc<dyn Acknowledger>
                }),
            })
        })
        .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        self.ensure_open(&state)?;
        for queue in state.queues.values_mut() {
            queue
                .subscriptions
                .retain(|s| !(s.channel_id == self.id && s.consumer_tag == consumer_tag));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        close_channel(&mut lock(&self.state), self.id, false);
        Ok(())
    }
}

struct MemoryAcker {
    state: Arc<Mutex<BrokerState>>,
    queue_name: String,
    channel_id: u64,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if !state.channels.contains_key(&self.channel_id) {
            return Err(BrokerError::ChannelClosed);
        }
        let queue = state.queues.get_mut(&self.queue_name).ok_or_else(|| {
            BrokerError::Protocol(anyhow::anyhow!("NOT_FOUND - no queue '{}'", self.queue_name))
        })?;
        let unacked = queue.unacked.remove(&self.delivery_tag).ok_or_else(|| {
            BrokerError::Protocol(anyhow::anyhow!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                self.delivery_tag
            ))
        })?;
        if let Some(subscription) = queue
            .subscriptions
            .iter_mut()
            .find(|s| s.consumer_tag == unacked.consumer_tag && s.channel_id == self.channel_id)
        {
            subscription.in_flight = subscription.in_flight.saturating_sub(1);
        }
        if requeue {
            queue.ready.push_front((unacked.message, true));
        }
        dispatch(&mut state, &self.queue_name);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(false)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(requeue)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(requeue)
    }
}

/// Push ready messages to subscriptions with spare prefetch capacity, round-robin.
fn dispatch(state: &mut BrokerState, queue_name: &str) {
    let BrokerState {
        queues,
        channels,
        next_delivery_tag,
        ..
    } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };
    while !queue.ready.is_empty() && !queue.subscriptions.is_empty() {
        let n_subscriptions = queue.subscriptions.len();
        let candidate = (0..n_subscriptions)
            .map(|offset| (queue.next_subscription + offset) % n_subscriptions)
            .find(|index| {
                let subscription = &queue.subscriptions[*index];
                let prefetch = channels
                    .get(&subscription.channel_id)
                    .map_or(0, |c| c.prefetch_count) as usize;
                subscription.auto_ack || prefetch == 0 || subscription.in_flight < prefetch
            });
        let Some(index) = candidate else {
            break;
        };
        queue.next_subscription = (index + 1) % n_subscriptions;

        let Some((message, redelivered)) = queue.ready.pop_front() else {
            break;
        };
        *next_delivery_tag += 1;
        let tag = *next_delivery_tag;
        let subscription = &mut queue.subscriptions[index];
        let item: Result<DeliveryItem, BrokerError> =
            Ok((tag, redelivered, message.clone(), subscription.auto_ack));
        if subscription.sender.send(item).is_err() {
            // The subscriber went away without cancelling.
            queue.subscriptions.remove(index);
            queue.ready.push_front((message, redelivered));
            continue;
        }
        if !subscription.auto_ack {
            subscription.in_flight += 1;
            queue.unacked.insert(
                tag,
                Unacked {
                    message,
                    channel_id: subscription.channel_id,
                    consumer_tag: subscription.consumer_tag.clone(),
                },
            );
        }
    }
}

fn close_connection(state: &mut BrokerState, connection_id: u64, faulted: bool) {
    if state.connections.remove(&connection_id).is_none() {
        return;
    }
    let channel_ids: Vec<u64> = state
        .channels
        .iter()
        .filter(|(_, c)| c.connection_id == connection_id)
        .map(|(id, _)| *id)
        .collect();
    for channel_id in channel_ids {
        close_channel(state, channel_id, faulted);
    }
}

/// Close a channel: its subscriptions are dropped and its unacked messages are requeued.
///
/// Subscribers get an error first if the channel `faulted`, otherwise their stream just ends.
fn close_channel(state: &mut BrokerState, channel_id: u64, faulted: bool) {
    if state.channels.remove(&channel_id).is_none() {
        return;
    }
    let queue_names: Vec<String> = state.queues.keys().cloned().collect();
    for queue_name in queue_names {
        let Some(queue) = state.queues.get_mut(&queue_name) else {
            continue;
        };
        queue.subscriptions.retain(|subscription| {
            if subscription.channel_id != channel_id {
                return true;
            }
            if faulted {
                let _ = subscription.sender.send(Err(BrokerError::ChannelClosed));
            }
            false
        });
        let mut orphaned: Vec<u64> = queue
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        // Requeue at the front, preserving the original delivery order.
        orphaned.sort_unstable_by(|a, b| b.cmp(a));
        for tag in orphaned {
            if let Some(unacked) = queue.unacked.remove(&tag) {
                queue.ready.push_front((unacked.message, true));
            }
        }
        dispatch(state, &queue_name);
    }
}
