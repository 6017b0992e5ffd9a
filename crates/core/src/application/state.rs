// Shared Scheduler State
// One lock per class guards its QueueStatus together with its consumer handles

use crate::application::pool::ConsumerHandle;
use crate::domain::{DomainError, QueueClass};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

/// Observed state of one class queue
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueStatus {
    pub backlog_depth: u64,
    /// Most recent latencies, oldest first, bounded by `latency_history`
    pub recent_latencies: VecDeque<Duration>,
    /// Consecutive ticks that observed an empty queue
    pub empty_ticks: u32,
}

impl QueueStatus {
    pub fn mean_recent_latency(&self) -> Duration {
        if self.recent_latencies.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.recent_latencies.iter().sum();
        total / self.recent_latencies.len() as u32
    }
}

/// Everything the class mutex protects
#[derive(Default)]
pub(crate) struct ClassSlot {
    pub(crate) status: QueueStatus,
    /// Insertion order: oldest first, so LIFO removal pops from the tail
    pub(crate) active: Vec<ConsumerHandle>,
    /// Signalled handles whose workers have not exited yet
    pub(crate) draining: Vec<ConsumerHandle>,
}

/// Per-class status and consumer registry shared by the pool, the
/// scheduling loop and the workers.
///
/// Locks are never held across `.await` and never two at a time.
pub struct SchedulerState {
    slots: HashMap<String, Mutex<ClassSlot>>,
    latency_history: usize,
}

impl SchedulerState {
    pub fn new<'a>(classes: impl IntoIterator<Item = &'a QueueClass>, latency_history: usize) -> Self {
        let slots = classes
            .into_iter()
            .map(|c| (c.name().to_string(), Mutex::new(ClassSlot::default())))
            .collect();
        Self {
            slots,
            latency_history: latency_history.max(1),
        }
    }

    /// Run `f` with the class lock held
    pub(crate) fn with_slot<R>(
        &self,
        class: &QueueClass,
        f: impl FnOnce(&mut ClassSlot) -> R,
    ) -> Result<R> {
        let slot = self
            .slots
            .get(class.name())
            .ok_or_else(|| DomainError::UnknownQueueClass(class.name().to_string()))?;
        let mut guard = slot.lock();
        Ok(f(&mut guard))
    }

    /// Store the sampled depth and advance the empty-tick streak
    pub fn update_depth(&self, class: &QueueClass, depth: u64) -> Result<()> {
        self.with_slot(class, |slot| {
            slot.status.backlog_depth = depth;
            if depth == 0 {
                slot.status.empty_ticks = slot.status.empty_ticks.saturating_add(1);
            } else {
                slot.status.empty_ticks = 0;
            }
        })
    }

    pub fn reset_empty_ticks(&self, class: &QueueClass) -> Result<()> {
        self.with_slot(class, |slot| slot.status.empty_ticks = 0)
    }

    pub fn record_latency(&self, class: &QueueClass, latency: Duration) -> Result<()> {
        let limit = self.latency_history;
        self.with_slot(class, |slot| {
            let latencies = &mut slot.status.recent_latencies;
            latencies.push_back(latency);
            while latencies.len() > limit {
                latencies.pop_front();
            }
        })
    }

    /// Copy of the class status
    pub fn status(&self, class: &QueueClass) -> Result<QueueStatus> {
        self.with_slot(class, |slot| slot.status.clone())
    }

    /// Remove an exited worker's handle from the registry.
    ///
    /// Called by the worker task itself after `run` returns. A handle still
    /// in the active set means the worker stopped on its own (connection
    /// loss, consume failure); the next tick's reconcile replaces it.
    pub(crate) fn deregister(&self, class: &QueueClass, consumer_id: &str) {
        let outcome = self.with_slot(class, |slot| {
            if let Some(pos) = slot.draining.iter().position(|h| h.id == consumer_id) {
                slot.draining.remove(pos);
                return Some(false);
            }
            if let Some(pos) = slot.active.iter().position(|h| h.id == consumer_id) {
                slot.active.remove(pos);
                return Some(true);
            }
            None
        });

        match outcome {
            Ok(Some(true)) => warn!(
                queue = %class,
                consumer_id = %consumer_id,
                "Consumer exited without being scaled down"
            ),
            Ok(Some(false)) => debug!(queue = %class, consumer_id = %consumer_id, "Consumer deregistered"),
            Ok(None) => {}
            Err(e) => warn!(consumer_id = %consumer_id, error = %e, "Deregister failed"),
        }
    }
}
