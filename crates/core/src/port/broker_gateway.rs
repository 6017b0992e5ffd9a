// Broker Gateway Port (Interface)
// Narrow facade over the topic-routed message broker

use crate::domain::{MessageEnvelope, QueueClass};
use async_trait::async_trait;
use thiserror::Error;

/// Broker-assigned delivery tag (unique per stream)
pub type DeliveryTag = u64;

/// Broker errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Exchange/queue/binding declaration rejected. Fatal at startup.
    #[error("Topology declaration rejected: {0}")]
    Topology(String),

    /// The class connection dropped. The owning consumer must stop.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Publish on a closed channel. Not retried internally.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Broker unreachable (e.g. at startup, or for a depth query)
    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// Acknowledgement handle for one delivery.
///
/// Both operations consume the handle, so a delivery is settled at most
/// once. Implementations must requeue a delivery whose handle is dropped
/// without being settled.
#[async_trait]
pub trait AckHandle: Send {
    /// Positive acknowledgement; the broker forgets the message
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Negative acknowledgement; `requeue = false` discards the message
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError>;
}

/// One message handed to a consumer
pub struct Delivery {
    pub payload: Vec<u8>,
    pub routing_key: String,
    pub delivery_tag: DeliveryTag,
    pub ack_handle: Box<dyn AckHandle>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Pull-based, infinite sequence of deliveries for one consumer.
///
/// Dropping the stream cancels the consumer; it cannot be restarted.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Wait for the next delivery.
    ///
    /// This is the only suspension point of a consumer. It must be
    /// cancel-safe: dropping the returned future before completion loses
    /// no message.
    ///
    /// # Errors
    /// - BrokerError::ConnectionLost if the class connection dropped
    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError>;
}

/// Broker gateway trait
///
/// Implementations:
/// - InMemoryBroker (orderpool-infra-memory): in-process topic broker
/// - mocks::MockGateway: scripted deliveries for unit tests
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Ensure exchange, durable queue and binding exist (idempotent)
    ///
    /// # Errors
    /// - BrokerError::Topology if the broker rejects a declaration
    async fn declare_topology(&self, class: &QueueClass) -> Result<(), BrokerError>;

    /// Publish an envelope with the class routing key
    ///
    /// # Errors
    /// - BrokerError::Publish if the channel is closed
    async fn publish(
        &self,
        class: &QueueClass,
        envelope: &MessageEnvelope,
    ) -> Result<(), BrokerError>;

    /// Start consuming the class queue with at most `prefetch_limit`
    /// unacknowledged deliveries outstanding
    async fn consume(
        &self,
        class: &QueueClass,
        prefetch_limit: u16,
    ) -> Result<Box<dyn DeliveryStream>, BrokerError>;

    /// Passive, point-in-time count of ready messages (may lag)
    async fn query_depth(&self, class: &QueueClass) -> Result<u64, BrokerError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::codec;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// How a delivery was settled
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Settlement {
        Ack,
        Nack { requeue: bool },
    }

    #[derive(Default)]
    struct MockQueue {
        ready: VecDeque<Vec<u8>>,
        depth_override: Option<u64>,
        fail_depth: bool,
        lost: bool,
    }

    #[derive(Default)]
    struct Shared {
        queues: Mutex<HashMap<String, MockQueue>>,
        settlements: Mutex<Vec<(String, DeliveryTag, Settlement)>>,
        notify: Notify,
        next_tag: AtomicU64,
    }

    /// Mock gateway: per-class FIFO of raw payloads, scripted depths and
    /// connection loss. Records every ack/nack.
    #[derive(Clone, Default)]
    pub struct MockGateway {
        shared: Arc<Shared>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        /// Enqueue a raw payload (may be malformed on purpose)
        pub fn push_raw(&self, class: &QueueClass, payload: Vec<u8>) {
            self.shared
                .queues
                .lock()
                .entry(class.queue_name())
                .or_default()
                .ready
                .push_back(payload);
            self.shared.notify.notify_waiters();
        }

        /// Report a fixed depth regardless of queued payloads
        pub fn set_depth(&self, class: &QueueClass, depth: u64) {
            self.shared
                .queues
                .lock()
                .entry(class.queue_name())
                .or_default()
                .depth_override = Some(depth);
        }

        pub fn fail_depth_queries(&self, class: &QueueClass, fail: bool) {
            self.shared
                .queues
                .lock()
                .entry(class.queue_name())
                .or_default()
                .fail_depth = fail;
        }

        /// Drop the class connection: waiting streams fail with ConnectionLost
        pub fn sever(&self, class: &QueueClass) {
            self.shared
                .queues
                .lock()
                .entry(class.queue_name())
                .or_default()
                .lost = true;
            self.shared.notify.notify_waiters();
        }

        pub fn restore(&self, class: &QueueClass) {
            self.shared
                .queues
                .lock()
                .entry(class.queue_name())
                .or_default()
                .lost = false;
        }

        pub fn settlements(&self) -> Vec<(String, DeliveryTag, Settlement)> {
            self.shared.settlements.lock().clone()
        }
    }

    struct MockAck {
        shared: Arc<Shared>,
        queue: String,
        tag: DeliveryTag,
    }

    #[async_trait]
    impl AckHandle for MockAck {
        async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
            self.shared
                .settlements
                .lock()
                .push((self.queue.clone(), self.tag, Settlement::Ack));
            Ok(())
        }

        async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BrokerError> {
            self.shared.settlements.lock().push((
                self.queue.clone(),
                self.tag,
                Settlement::Nack { requeue },
            ));
            Ok(())
        }
    }

    struct MockStream {
        shared: Arc<Shared>,
        queue: String,
        routing_key: String,
    }

    impl MockStream {
        fn try_take(&self) -> Option<Result<Delivery, BrokerError>> {
            let mut queues = self.shared.queues.lock();
            let queue = queues.entry(self.queue.clone()).or_default();
            if queue.lost {
                return Some(Err(BrokerError::ConnectionLost(self.queue.clone())));
            }
            let payload = queue.ready.pop_front()?;
            let tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
            Some(Ok(Delivery {
                payload,
                routing_key: self.routing_key.clone(),
                delivery_tag: tag,
                ack_handle: Box::new(MockAck {
                    shared: Arc::clone(&self.shared),
                    queue: self.queue.clone(),
                    tag,
                }),
            }))
        }
    }

    #[async_trait]
    impl DeliveryStream for MockStream {
        async fn next_delivery(&mut self) -> Result<Delivery, BrokerError> {
            loop {
                let notified = self.shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(result) = self.try_take() {
                    return result;
                }
                notified.await;
            }
        }
    }

    #[async_trait]
    impl BrokerGateway for MockGateway {
        async fn declare_topology(&self, class: &QueueClass) -> Result<(), BrokerError> {
            self.shared
                .queues
                .lock()
                .entry(class.queue_name())
                .or_default();
            Ok(())
        }

        async fn publish(
            &self,
            class: &QueueClass,
            envelope: &MessageEnvelope,
        ) -> Result<(), BrokerError> {
            let payload =
                codec::encode(envelope).map_err(|e| BrokerError::Publish(e.to_string()))?;
            self.push_raw(class, payload);
            Ok(())
        }

        async fn consume(
            &self,
            class: &QueueClass,
            _prefetch_limit: u16,
        ) -> Result<Box<dyn DeliveryStream>, BrokerError> {
            let queue = class.queue_name();
            if self
                .shared
                .queues
                .lock()
                .get(&queue)
                .is_some_and(|q| q.lost)
            {
                return Err(BrokerError::ConnectionLost(queue));
            }
            Ok(Box::new(MockStream {
                shared: Arc::clone(&self.shared),
                queue,
                routing_key: class.routing_key().to_string(),
            }))
        }

        async fn query_depth(&self, class: &QueueClass) -> Result<u64, BrokerError> {
            let queues = self.shared.queues.lock();
            match queues.get(&class.queue_name()) {
                Some(q) if q.fail_depth => {
                    Err(BrokerError::Unavailable(format!("{} depth query", class)))
                }
                Some(q) => Ok(q.depth_override.unwrap_or(q.ready.len() as u64)),
                None => Ok(0),
            }
        }
    }
}
