// In-process topic broker implementing BrokerGateway
//
// One topic exchange with bindings, durable FIFO queues, per-consumer
// prefetch accounting and fault injection (connection loss, outage,
// conflicting declarations). All queue state sits behind a single lock
// that is never held across an await.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::topic::topic_matches;
use orderpool_core::domain::{codec, MessageEnvelope, QueueClass, ORDER_EXCHANGE};
use orderpool_core::port::{AckHandle, BrokerError, BrokerGateway, Delivery, DeliveryStream, DeliveryTag};

#[derive(Debug, Clone)]
struct Binding {
    queue: String,
    pattern: String,
}

struct Message {
    payload: Vec<u8>,
    routing_key: String,
}

struct QueueState {
    durable: bool,
    ready: VecDeque<Message>,
    /// Unacknowledged deliveries per consumer tag
    unacked: HashMap<u64, usize>,
    /// Bumped on every sever; streams opened under an older epoch are dead
    epoch: u64,
    severed: bool,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            epoch: 0,
            severed: false,
            notify: Arc::new(Notify::new()),
        }
    }

    fn unacked_total(&self) -> usize {
        self.unacked.values().sum()
    }
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, QueueState>,
}

struct BrokerInner {
    host: String,
    available: AtomicBool,
    topology: Mutex<Topology>,
    next_consumer_tag: AtomicU64,
}

impl BrokerInner {
    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable(format!("broker at {} is unreachable", self.host)))
        }
    }

    /// Free the consumer's prefetch slot; `requeue` goes back to the head
    fn settle(&self, queue: &str, consumer_tag: u64, requeue: Option<Message>) {
        let mut topology = self.topology.lock();
        if let Some(state) = topology.queues.get_mut(queue) {
            release_slot(state, consumer_tag);
            if let Some(message) = requeue {
                state.ready.push_front(message);
            }
            state.notify.notify_waiters();
        }
    }
}

fn release_slot(state: &mut QueueState, consumer_tag: u64) {
    if let Some(count) = state.unacked.get_mut(&consumer_tag) {
        *count = count.saturating_sub(1);
    }
}

/// In-process broker.
///
/// Cloning shares the same broker; every clone sees the same queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    /// Connect to `host` (`name` or `name:port`)
    ///
    /// # Errors
    /// - BrokerError::Unavailable if the host is empty or malformed
    pub fn connect(host: &str) -> Result<Self, BrokerError> {
        let host = host.trim();
        let (name, port) = match host.rsplit_once(':') {
            Some((name, port)) => (name, Some(port)),
            None => (host, None),
        };
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(BrokerError::Unavailable(format!("invalid broker host `{}`", host)));
        }
        if let Some(port) = port {
            if port.parse::<u16>().is_err() {
                return Err(BrokerError::Unavailable(format!("invalid broker port in `{}`", host)));
            }
        }

        info!(host = %host, "Connected to in-process broker");
        Ok(Self {
            inner: Arc::new(BrokerInner {
                host: host.to_string(),
                available: AtomicBool::new(true),
                topology: Mutex::new(Topology::default()),
                next_consumer_tag: AtomicU64::new(0),
            }),
        })
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Simulate a broker outage; every operation fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        if !available {
            for state in self.inner.topology.lock().queues.values() {
                state.notify.notify_waiters();
            }
        }
    }

    /// Drop the class connection: open streams fail with ConnectionLost and
    /// publishes to the class fail until `restore_connection`
    pub fn sever_connection(&self, class: &QueueClass) {
        let mut topology = self.inner.topology.lock();
        if let Some(state) = topology.queues.get_mut(&class.queue_name()) {
            state.severed = true;
            state.epoch += 1;
            state.notify.notify_waiters();
            warn!(queue = %class, "Connection severed");
        }
    }

    pub fn restore_connection(&self, class: &QueueClass) {
        let mut topology = self.inner.topology.lock();
        if let Some(state) = topology.queues.get_mut(&class.queue_name()) {
            state.severed = false;
            info!(queue = %class, "Connection restored");
        }
    }

    /// Declare a bare queue with explicit arguments, bypassing the class
    /// topology (used to provoke declaration conflicts)
    pub fn declare_queue_raw(&self, queue: &str, durable: bool) {
        self.inner
            .topology
            .lock()
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState::new(durable));
    }

    /// Enqueue raw bytes on the class queue, bypassing the codec
    pub fn publish_raw(&self, class: &QueueClass, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut topology = self.inner.topology.lock();
        let state = topology
            .queues
            .get_mut(&class.queue_name())
            .ok_or_else(|| BrokerError::Publish(format!("{} not declared", class)))?;
        state.ready.push_back(Message {
            payload,
            routing_key: class.routing_key().to_string(),
        });
        state.notify.notify_waiters();
        Ok(())
    }

    /// Deliveries handed out but not yet settled
    pub fn unacked_count(&self, class: &QueueClass) -> usize {
        self.inner
            .topology
            .lock()
            .queues
            .get(&class.queue_name())
            .map(QueueState::unacked_total)
            .unwrap_or(0)
    }
}

#[async_trait]
impl BrokerGateway for InMemoryBroker {
    async fn declare_topology(&self, class: &QueueClass) -> Result<(), BrokerError> {
        self.inner.check_available()?;
        let queue = class.queue_name();
        let mut topology = self.inner.topology.lock();

        match topology.queues.get(&queue) {
            Some(state) if !state.durable => {
                return Err(BrokerError::Topology(format!(
                    "queue `{}` already declared with durable=false",
                    queue
                )));
            }
            Some(_) => {}
            None => {
                topology.queues.insert(queue.clone(), QueueState::new(true));
            }
        }

        let bindings = topology
            .exchanges
            .entry(ORDER_EXCHANGE.to_string())
            .or_default();
        if !bindings
            .iter()
            .any(|b| b.queue == queue && b.pattern == class.routing_key())
        {
            bindings.push(Binding {
                queue: queue.clone(),
                pattern: class.routing_key().to_string(),
            });
        }

        debug!(
            exchange = ORDER_EXCHANGE,
            queue = %queue,
            routing_key = class.routing_key(),
            "Topology declared"
        );
        Ok(())
    }

    async fn publish(
        &self,
        class: &QueueClass,
        envelope: &MessageEnvelope,
    ) -> Result<(), BrokerError> {
        self.inner
            .check_available()
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        let payload = codec::encode(envelope).map_err(|e| BrokerError::Publish(e.to_string()))?;

        let mut topology = self.inner.topology.lock();
        if topology
            .queues
            .get(&class.queue_name())
            .is_some_and(|q| q.severed)
        {
            return Err(BrokerError::Publish(format!("channel for {} is closed", class)));
        }

        let targets: Vec<String> = topology
            .exchanges
            .get(ORDER_EXCHANGE)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|b| topic_matches(&b.pattern, class.routing_key()))
                    .map(|b| b.queue.clone())
                    .collect()
            })
            .unwrap_or_default();

        if targets.is_empty() {
            debug!(routing_key = class.routing_key(), "Unroutable message dropped");
            return Ok(());
        }
        for target in targets {
            if let Some(state) = topology.queues.get_mut(&target) {
                state.ready.push_back(Message {
                    payload: payload.clone(),
                    routing_key: class.routing_key().to_string(),
                });
                state.notify.notify_waiters();
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        class: &QueueClass,
        prefetch_limit: u16,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        self.inner.check_available()?;
        let queue = class.queue_name();
        let consumer_tag = self.inner.next_consumer_tag.fetch_add(1, Ordering::SeqCst) + 1;

        let mut topology = self.inner.topology.lock();
        let state = topology
            .queues
            .get_mut(&queue)
            .ok_or_else(|| BrokerError::Topology(format!("queue `{}` not declared", queue)))?;
        if state.severed {
            return Err(BrokerError::ConnectionLost(format!("{} connection is down", queue)));
        }
        state.unacked.insert(consumer_tag, 0);

        Ok(Box::new(MemoryStream {
            inner: Arc::clone(&self.inner),
            queue,
            consumer_tag,
            epoch: state.epoch,
            prefetch_limit: usize::from(prefetch_limit.max(1)),
            notify: Arc::clone(&state.notify),
            next_delivery_tag: 0,
        }))
    }

    async fn query_depth(&self, class: &QueueClass) -> Result<u64, BrokerError> {
        self.inner.check_available()?;
        let topology = self.inner.topology.lock();
        topology
            .queues
            .get(&class.queue_name())
            .map(|q| q.ready.len() as u64)
            .ok_or_else(|| BrokerError::Topology(format!("queue `{}` not declared", class.queue_name())))
    }
}

struct MemoryStream {
    inner: Arc<BrokerInner>,
    queue: String,
    consumer_tag: u64,
    epoch: u64,
    prefetch_limit: usize,
    notify: Arc<Notify>,
    next_delivery_tag: DeliveryTag,
}

impl MemoryStream {
    /// Ok(None) means nothing deliverable yet (empty queue or prefetch full)
    fn try_take(&mut self) -> Result<Option<Delivery>, BrokerError> {
        if self.inner.check_available().is_err() {
            return Err(BrokerError::ConnectionLost(format!("{}: broker went away", self.queue)));
        }
        let mut topology = self.inner.topology.lock();
        let state = topology
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::ConnectionLost(format!("{} was deleted", self.queue)))?;
        if state.epoch != self.epoch {
            return Err(BrokerError::ConnectionLost(format!("{} connection closed", self.queue)));
        }

        let in_flight = state.unacked.get(&self.consumer_tag).copied().unwrap_or(0);
        if in_flight >= self.prefetch_limit {
            return Ok(None);
        }
        let Some(message) = state.ready.pop_front() else {
            return Ok(None);
        };
        *state.unacked.entry(self.consumer_tag).or_insert(0) += 1;
        drop(topology);

        self.next_delivery_tag += 1;
        let routing_key = message.routing_key.clone();
        Ok(Some(Delivery {
            payload: message.payload.clone(),
            routing_key,
            delivery_tag: self.next_delivery_tag,
            ack_handle: Box::new(MemoryAck {
                inner: Arc::clone(&self.inner),
                queue: self.queue.clone(),
                consumer_tag: self.consumer_tag,
                epoch: self.epoch,
                message: Some(message),
            }),
        }))
    }
}

#[async_trait]
impl DeliveryStream for MemoryStream {
    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError> {
        loop {
            let notify = Arc::clone(&self.notify);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take()? {
                return Ok(delivery);
            }
            notified.await;
        }
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        // Outstanding handles still settle against the queue; only the
        // consumer registration goes away once nothing is in flight
        let mut topology = self.inner.topology.lock();
        if let Some(state) = topology.queues.get_mut(&self.queue) {
            if state.unacked.get(&self.consumer_tag) == Some(&0) {
                state.unacked.remove(&self.consumer_tag);
            }
        }
    }
}

struct MemoryAck {
    inner: Arc<BrokerInner>,
    queue: String,
    consumer_tag: u64,
    epoch: u64,
    /// Some until settled
    message: Option<Message>,
}

impl MemoryAck {
    fn connection_open(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
            && self
                .inner
                .topology
                .lock()
                .queues
                .get(&self.queue)
                .is_some_and(|q| q.epoch == self.epoch)
    }

    fn lost(&self) -> BrokerError {
        BrokerError::ConnectionLost(format!("{} connection closed before settlement", self.queue))
    }
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        let mut this = self;
        if !this.connection_open() {
            // Drop requeues the message
            return Err(this.lost());
        }
        this.message = None;
        this.inner.settle(&this.queue, this.consumer_tag, None);
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
        let mut this = self;
        if !this.connection_open() {
            return Err(this.lost());
        }
        let message = this.message.take();
        if requeue {
            this.inner.settle(&this.queue, this.consumer_tag, message);
        } else {
            debug!(queue = %this.queue, "Message discarded");
            this.inner.settle(&this.queue, this.consumer_tag, None);
        }
        Ok(())
    }
}

impl Drop for MemoryAck {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            debug!(queue = %self.queue, "Unsettled delivery returned to queue");
            self.inner.settle(&self.queue, self.consumer_tag, Some(message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn order(id: &str) -> MessageEnvelope {
        MessageEnvelope::new(id, "cust_321", vec!["item_2".into(), "item_5".into()], Utc::now())
    }

    async fn broker_with(class: &QueueClass) -> InMemoryBroker {
        let broker = InMemoryBroker::connect("localhost").unwrap();
        broker.declare_topology(class).await.unwrap();
        broker
    }

    fn order_id(delivery: &Delivery) -> String {
        codec::decode(&delivery.payload).unwrap().order_id
    }

    #[test]
    fn connect_validates_host() {
        assert!(InMemoryBroker::connect("rabbitmq:5672").is_ok());
        assert!(InMemoryBroker::connect("").is_err());
        assert!(InMemoryBroker::connect("rabbit mq").is_err());
        assert!(InMemoryBroker::connect("localhost:notaport").is_err());
    }

    #[tokio::test]
    async fn declare_is_idempotent_and_rejects_non_durable_conflict() {
        let class = QueueClass::standard();
        let broker = broker_with(&class).await;
        broker.declare_topology(&class).await.unwrap();

        broker.declare_queue_raw("express_orders", false);
        let err = broker.declare_topology(&QueueClass::express()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Topology(_)));
    }

    #[tokio::test]
    async fn publish_routes_by_class_and_depth_counts_ready() {
        let priority = QueueClass::priority();
        let broker = broker_with(&priority).await;
        broker.declare_topology(&QueueClass::express()).await.unwrap();

        broker.publish(&priority, &order("priority_1001")).await.unwrap();
        broker.publish(&priority, &order("priority_1002")).await.unwrap();

        assert_eq!(broker.query_depth(&priority).await.unwrap(), 2);
        assert_eq!(broker.query_depth(&QueueClass::express()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deliveries_are_fifo_and_ack_removes() {
        let class = QueueClass::express();
        let broker = broker_with(&class).await;
        for id in ["express_1", "express_2"] {
            broker.publish(&class, &order(id)).await.unwrap();
        }

        let mut stream = broker.consume(&class, 5).await.unwrap();
        let first = stream.next_delivery().await.unwrap();
        let second = stream.next_delivery().await.unwrap();
        assert_eq!(order_id(&first), "express_1");
        assert_eq!(order_id(&second), "express_2");
        assert_eq!(first.routing_key, "order.express");
        assert_eq!((first.delivery_tag, second.delivery_tag), (1, 2));

        first.ack_handle.ack().await.unwrap();
        second.ack_handle.ack().await.unwrap();
        assert_eq!(broker.unacked_count(&class), 0);
        assert_eq!(broker.query_depth(&class).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn prefetch_limits_outstanding_deliveries() {
        let class = QueueClass::priority();
        let broker = broker_with(&class).await;
        broker.publish(&class, &order("priority_1")).await.unwrap();
        broker.publish(&class, &order("priority_2")).await.unwrap();

        let mut stream = broker.consume(&class, 1).await.unwrap();
        let first = stream.next_delivery().await.unwrap();

        assert!(timeout(Duration::from_millis(50), stream.next_delivery()).await.is_err());
        assert_eq!(broker.query_depth(&class).await.unwrap(), 1);

        first.ack_handle.ack().await.unwrap();
        let second = timeout(Duration::from_millis(200), stream.next_delivery())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order_id(&second), "priority_2");
    }

    #[tokio::test]
    async fn nack_requeue_goes_to_head_and_nack_drop_discards() {
        let class = QueueClass::standard();
        let broker = broker_with(&class).await;
        broker.publish(&class, &order("standard_1")).await.unwrap();
        broker.publish(&class, &order("standard_2")).await.unwrap();

        let mut stream = broker.consume(&class, 10).await.unwrap();
        let first = stream.next_delivery().await.unwrap();
        first.ack_handle.nack(true).await.unwrap();

        let again = stream.next_delivery().await.unwrap();
        assert_eq!(order_id(&again), "standard_1");
        again.ack_handle.nack(false).await.unwrap();

        assert_eq!(broker.query_depth(&class).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dropped_handle_is_requeued() {
        let class = QueueClass::standard();
        let broker = broker_with(&class).await;
        broker.publish(&class, &order("standard_9")).await.unwrap();

        let mut stream = broker.consume(&class, 1).await.unwrap();
        let delivery = stream.next_delivery().await.unwrap();
        drop(delivery);

        assert_eq!(broker.unacked_count(&class), 0);
        assert_eq!(broker.query_depth(&class).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_wait_loses_nothing() {
        let class = QueueClass::express();
        let broker = broker_with(&class).await;
        let mut stream = broker.consume(&class, 1).await.unwrap();

        assert!(timeout(Duration::from_millis(20), stream.next_delivery()).await.is_err());

        broker.publish(&class, &order("express_77")).await.unwrap();
        let delivery = stream.next_delivery().await.unwrap();
        assert_eq!(order_id(&delivery), "express_77");
    }

    #[tokio::test]
    async fn sever_fails_open_streams_and_publishes() {
        let class = QueueClass::priority();
        let broker = broker_with(&class).await;
        let mut stream = broker.consume(&class, 1).await.unwrap();

        let waiter = tokio::spawn(async move { stream.next_delivery().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.sever_connection(&class);

        let result = timeout(Duration::from_millis(200), waiter).await.unwrap().unwrap();
        assert!(matches!(result, Err(BrokerError::ConnectionLost(_))));
        assert!(matches!(
            broker.publish(&class, &order("priority_5")).await,
            Err(BrokerError::Publish(_))
        ));
        assert!(matches!(
            broker.consume(&class, 1).await,
            Err(BrokerError::ConnectionLost(_))
        ));

        broker.restore_connection(&class);
        broker.publish(&class, &order("priority_6")).await.unwrap();
        let mut fresh = broker.consume(&class, 1).await.unwrap();
        assert_eq!(order_id(&fresh.next_delivery().await.unwrap()), "priority_6");
    }

    #[tokio::test]
    async fn unavailable_broker_rejects_everything() {
        let class = QueueClass::standard();
        let broker = InMemoryBroker::connect("localhost").unwrap();
        broker.set_available(false);

        assert!(matches!(
            broker.declare_topology(&class).await,
            Err(BrokerError::Unavailable(_))
        ));
        assert!(broker.query_depth(&class).await.is_err());
    }
}
