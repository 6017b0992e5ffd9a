// Consumer Worker - per-consumer delivery loop

pub mod cancel;
pub mod constants;

pub use cancel::{cancel_channel, CancelSignal, CancelToken};

use crate::application::metrics::{MetricsAggregator, MetricsSample};
use crate::application::state::SchedulerState;
use crate::domain::{codec, DomainError, QueueClass};
use crate::error::Result;
use crate::port::{AckHandle, BrokerError, BrokerGateway, Delivery, OrderProcessor, TimeProvider};
use constants::REQUEUE_ON_FAILURE;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Consumer lifecycle
///
/// ```text
/// Idle ──► Running ──► Draining ──► Stopped
///   │         │                       ▲
///   └─────────┴───────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, stream not yet open
    Idle,
    /// Consuming deliveries
    Running,
    /// Cancel raised while a message was in flight; finishing it
    Draining,
    /// Terminal
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Running => "running",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
        }
    }

    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Idle, Running) | (Idle, Stopped) | (Running, Draining) | (Running, Stopped) | (Draining, Stopped)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why `run` returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Cancelled,
    /// The class connection dropped; the pool replaces the consumer later
    ConnectionLost,
    /// The stream could not be opened
    ConsumeFailed(BrokerError),
}

/// Collaborators shared by every consumer
#[derive(Clone)]
pub struct WorkerDeps {
    pub gateway: Arc<dyn BrokerGateway>,
    pub processor: Arc<dyn OrderProcessor>,
    pub metrics: Arc<MetricsAggregator>,
    pub state: Arc<SchedulerState>,
    pub time_provider: Arc<dyn TimeProvider>,
}

/// Read-only view of a running worker, kept in its ConsumerHandle
#[derive(Clone)]
pub struct WorkerMonitor {
    state_rx: watch::Receiver<WorkerState>,
    live: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
}

impl WorkerMonitor {
    pub fn state(&self) -> WorkerState {
        *self.state_rx.borrow()
    }

    /// True while the delivery stream is open
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Messages acknowledged so far
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Wait until the worker reaches `target`; false if it exited first
    pub async fn wait_for(&self, target: WorkerState) -> bool {
        let mut rx = self.state_rx.clone();
        let ok = rx.wait_for(|s| *s == target).await.is_ok();
        ok
    }
}

/// One consumer bound to one class queue
pub struct ConsumerWorker {
    id: String,
    class: QueueClass,
    prefetch_limit: u16,
    deps: WorkerDeps,
    state_tx: watch::Sender<WorkerState>,
    live: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
}

impl ConsumerWorker {
    pub fn new(
        id: impl Into<String>,
        class: QueueClass,
        prefetch_limit: u16,
        deps: WorkerDeps,
    ) -> (Self, WorkerMonitor) {
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
        let live = Arc::new(AtomicBool::new(false));
        let processed = Arc::new(AtomicU64::new(0));

        let monitor = WorkerMonitor {
            state_rx,
            live: Arc::clone(&live),
            processed: Arc::clone(&processed),
        };
        let worker = Self {
            id: id.into(),
            class,
            prefetch_limit,
            deps,
            state_tx,
            live,
            processed,
        };
        (worker, monitor)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    fn transition(&self, next: WorkerState) -> Result<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(DomainError::InvalidStateTransition {
                from: current.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        self.state_tx.send_replace(next);
        Ok(())
    }

    /// Consume until cancelled or the connection drops.
    ///
    /// The delivery wait is the only point where cancellation is observed
    /// without a message in hand; a message already taken is always
    /// finished and settled.
    pub async fn run(self, mut cancel: CancelToken) -> Result<WorkerExit> {
        let mut stream = match self
            .deps
            .gateway
            .consume(&self.class, self.prefetch_limit)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    queue = %self.class,
                    consumer_id = %self.id,
                    error = %e,
                    "Failed to open delivery stream"
                );
                self.transition(WorkerState::Stopped)?;
                return Ok(WorkerExit::ConsumeFailed(e));
            }
        };

        self.transition(WorkerState::Running)?;
        self.live.store(true, Ordering::SeqCst);
        info!(
            queue = %self.class,
            consumer_id = %self.id,
            prefetch = self.prefetch_limit,
            "Consumer started"
        );

        let exit = loop {
            if cancel.is_raised() {
                break WorkerExit::Cancelled;
            }

            let next = tokio::select! {
                biased;
                _ = cancel.raised() => break WorkerExit::Cancelled,
                next = stream.next_delivery() => next,
            };

            match next {
                Ok(delivery) => self.handle_delivery(delivery, &mut cancel).await,
                Err(e) => {
                    warn!(
                        queue = %self.class,
                        consumer_id = %self.id,
                        error = %e,
                        "Delivery stream failed, stopping consumer"
                    );
                    break WorkerExit::ConnectionLost;
                }
            }
        };

        drop(stream);
        self.live.store(false, Ordering::SeqCst);
        self.transition(WorkerState::Stopped)?;

        info!(
            queue = %self.class,
            consumer_id = %self.id,
            processed = self.processed.load(Ordering::SeqCst),
            exit = ?exit,
            "Consumer stopped"
        );
        Ok(exit)
    }

    async fn handle_delivery(&self, delivery: Delivery, cancel: &mut CancelToken) {
        let Delivery {
            payload,
            delivery_tag,
            ack_handle,
            ..
        } = delivery;

        let envelope = match codec::decode(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    queue = %self.class,
                    consumer_id = %self.id,
                    delivery_tag,
                    error = %e,
                    "Discarding malformed message"
                );
                self.reject(ack_handle, delivery_tag).await;
                return;
            }
        };

        // Own task so a panic in the processor cannot take the consumer down
        let processor = Arc::clone(&self.deps.processor);
        let class = self.class.clone();
        let task_envelope = envelope.clone();
        let mut task = tokio::spawn(async move { processor.process(&class, &task_envelope).await });

        let outcome = tokio::select! {
            biased;
            joined = &mut task => joined,
            _ = cancel.raised() => {
                if let Err(e) = self.transition(WorkerState::Draining) {
                    warn!(consumer_id = %self.id, error = %e, "Unexpected state while draining");
                }
                info!(
                    queue = %self.class,
                    consumer_id = %self.id,
                    order_id = %envelope.order_id,
                    "Cancel requested, finishing in-flight message"
                );
                (&mut task).await
            }
        };

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    queue = %self.class,
                    consumer_id = %self.id,
                    order_id = %envelope.order_id,
                    error = %e,
                    "Order processing failed"
                );
                self.reject(ack_handle, delivery_tag).await;
                return;
            }
            Err(join_error) => {
                error!(
                    queue = %self.class,
                    consumer_id = %self.id,
                    order_id = %envelope.order_id,
                    panicked = join_error.is_panic(),
                    "Order processing aborted"
                );
                self.reject(ack_handle, delivery_tag).await;
                return;
            }
        }

        let now = self.deps.time_provider.now();
        let (latency, clock_skew) = envelope.latency_at(now);
        if clock_skew {
            warn!(
                queue = %self.class,
                order_id = %envelope.order_id,
                timestamp = %envelope.timestamp,
                "Envelope timestamp is in the future, latency clamped to 0"
            );
        }

        if let Err(e) = ack_handle.ack().await {
            warn!(
                queue = %self.class,
                consumer_id = %self.id,
                order_id = %envelope.order_id,
                error = %e,
                "Ack failed, no sample recorded"
            );
            return;
        }

        self.deps.metrics.record_sample(&MetricsSample {
            queue_class: self.class.clone(),
            latency,
            recorded_at: now,
            clock_skew,
        });
        if let Err(e) = self.deps.state.record_latency(&self.class, latency) {
            warn!(queue = %self.class, error = %e, "Could not record latency");
        }
        self.processed.fetch_add(1, Ordering::SeqCst);

        debug!(
            queue = %self.class,
            consumer_id = %self.id,
            order_id = %envelope.order_id,
            latency_ms = latency.as_millis() as u64,
            "Order acknowledged"
        );
    }

    async fn reject(&self, ack_handle: Box<dyn AckHandle>, delivery_tag: u64) {
        if let Err(e) = ack_handle.nack(REQUEUE_ON_FAILURE).await {
            warn!(
                queue = %self.class,
                consumer_id = %self.id,
                delivery_tag,
                error = %e,
                "Nack failed"
            );
        }
    }
}
