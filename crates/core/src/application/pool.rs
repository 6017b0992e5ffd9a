// Pool Manager - owns consumer handles and resizes class pools

use crate::application::worker::{cancel_channel, CancelSignal, ConsumerWorker, WorkerDeps, WorkerMonitor};
use crate::config::ClassConfig;
use crate::domain::{DomainError, QueueClass};
use crate::error::Result;
use crate::port::IdProvider;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Pool-side record of one spawned consumer
pub struct ConsumerHandle {
    pub id: String,
    pub class: QueueClass,
    cancel: CancelSignal,
    monitor: WorkerMonitor,
    task: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn monitor(&self) -> &WorkerMonitor {
        &self.monitor
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_raised()
    }
}

/// Per-consumer counter reported by `consumer_stats`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    pub consumer_id: String,
    pub processed: u64,
    pub live: bool,
}

/// Spawns and retires consumers so each class pool matches its target.
///
/// Must be used from within a Tokio runtime: scale-up spawns tasks.
pub struct PoolManager {
    classes: HashMap<String, ClassConfig>,
    deps: WorkerDeps,
    id_provider: Arc<dyn IdProvider>,
}

impl PoolManager {
    pub fn new(classes: &[ClassConfig], deps: WorkerDeps, id_provider: Arc<dyn IdProvider>) -> Self {
        Self {
            classes: classes.iter().map(|c| (c.name.clone(), c.clone())).collect(),
            deps,
            id_provider,
        }
    }

    fn class_config(&self, class: &QueueClass) -> Result<&ClassConfig> {
        self.classes
            .get(class.name())
            .ok_or_else(|| DomainError::UnknownQueueClass(class.name().to_string()).into())
    }

    /// Resize the class pool to `target`, clamped into [min, max].
    ///
    /// Growing spawns new consumers; shrinking signals the most recently
    /// added consumers and returns without waiting for them to drain.
    /// Returns the clamped target.
    pub fn scale_to(&self, class: &QueueClass, target: usize) -> Result<usize> {
        let config = self.class_config(class)?;
        let target = config.clamp(target);
        let prefetch = config.prefetch_limit;

        // Spawn under the class lock so a worker that exits at once still
        // finds its handle when it deregisters
        let (before, retired) = self.deps.state.with_slot(class, |slot| {
            let before = slot.active.len();
            let mut retired = Vec::new();
            if target > before {
                for _ in before..target {
                    slot.active.push(self.spawn_consumer(class, prefetch));
                }
            } else if target < before {
                let removed: Vec<ConsumerHandle> = slot.active.drain(target..).rev().collect();
                for handle in removed {
                    handle.cancel.raise();
                    retired.push(handle.id.clone());
                    slot.draining.push(handle);
                }
            }
            (before, retired)
        })?;

        if before != target {
            info!(
                queue = %class,
                from = before,
                to = target,
                retired = ?retired,
                "Scaled consumer pool"
            );
        }
        Ok(target)
    }

    fn spawn_consumer(&self, class: &QueueClass, prefetch_limit: u16) -> ConsumerHandle {
        let id = self.id_provider.generate_id();
        let (signal, token) = cancel_channel();
        let (worker, monitor) =
            ConsumerWorker::new(id.clone(), class.clone(), prefetch_limit, self.deps.clone());

        let state = Arc::clone(&self.deps.state);
        let task_class = class.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            match worker.run(token).await {
                Ok(exit) => debug!(consumer_id = %task_id, exit = ?exit, "Consumer task finished"),
                Err(e) => error!(consumer_id = %task_id, error = %e, "Consumer task failed"),
            }
            state.deregister(&task_class, &task_id);
        });

        ConsumerHandle {
            id,
            class: class.clone(),
            cancel: signal,
            monitor,
            task: Some(task),
        }
    }

    /// Active (non-draining) consumers of the class
    pub fn current_count(&self, class: &QueueClass) -> Result<usize> {
        self.deps.state.with_slot(class, |slot| slot.active.len())
    }

    /// Signalled consumers that have not exited yet
    pub fn draining_count(&self, class: &QueueClass) -> Result<usize> {
        self.deps.state.with_slot(class, |slot| slot.draining.len())
    }

    /// Active consumers across all classes (one class lock at a time)
    pub fn total_count(&self) -> usize {
        self.classes
            .values()
            .filter_map(|c| self.current_count(&c.queue_class()).ok())
            .sum()
    }

    /// Processed counters of the active consumers, oldest first
    pub fn consumer_stats(&self, class: &QueueClass) -> Result<Vec<ConsumerStats>> {
        self.deps.state.with_slot(class, |slot| {
            slot.active
                .iter()
                .map(|h| ConsumerStats {
                    consumer_id: h.id.clone(),
                    processed: h.monitor.processed(),
                    live: h.monitor.is_live(),
                })
                .collect()
        })
    }

    /// Signal every consumer and wait for all of them to finish
    pub async fn shutdown(&self) {
        let mut tasks = Vec::new();
        for config in self.classes.values() {
            let class = config.queue_class();
            let taken = self.deps.state.with_slot(&class, |slot| {
                let mut taken = Vec::new();
                for handle in slot.active.drain(..).collect::<Vec<_>>() {
                    handle.cancel.raise();
                    slot.draining.push(handle);
                }
                for handle in slot.draining.iter_mut() {
                    if let Some(task) = handle.task.take() {
                        taken.push((handle.id.clone(), task));
                    }
                }
                taken
            });
            match taken {
                Ok(taken) => tasks.extend(taken),
                Err(e) => error!(queue = %class, error = %e, "Shutdown could not reach class"),
            }
        }

        info!(consumers = tasks.len(), "Waiting for consumers to drain");
        for (id, task) in tasks {
            if let Err(e) = task.await {
                error!(consumer_id = %id, error = %e, "Consumer task did not finish cleanly");
            }
        }
        info!("All consumers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::metrics::MetricsAggregator;
    use crate::application::state::SchedulerState;
    use crate::application::worker::WorkerState;
    use crate::port::broker_gateway::mocks::MockGateway;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::order_processor::mocks::MockProcessor;
    use crate::port::time_provider::SystemTimeProvider;
    use std::time::Duration;

    fn pool_with(gateway: MockGateway) -> (PoolManager, Arc<SchedulerState>) {
        let classes = vec![ClassConfig::new(&QueueClass::priority(), 1, 3, 1, 10)];
        let state = Arc::new(SchedulerState::new([&QueueClass::priority()], 100));
        let deps = WorkerDeps {
            gateway: Arc::new(gateway),
            processor: Arc::new(MockProcessor::new_success()),
            metrics: Arc::new(MetricsAggregator::new()),
            state: Arc::clone(&state),
            time_provider: Arc::new(SystemTimeProvider),
        };
        let pool = PoolManager::new(&classes, deps, Arc::new(SequentialIdProvider::default()));
        (pool, state)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn scale_to_clamps_into_bounds() {
        let (pool, _state) = pool_with(MockGateway::new());
        let class = QueueClass::priority();

        assert_eq!(pool.scale_to(&class, 10).unwrap(), 3);
        assert_eq!(pool.current_count(&class).unwrap(), 3);

        assert_eq!(pool.scale_to(&class, 0).unwrap(), 1);
        assert_eq!(pool.current_count(&class).unwrap(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn scale_down_removes_most_recent_first() {
        let (pool, _state) = pool_with(MockGateway::new());
        let class = QueueClass::priority();

        pool.scale_to(&class, 3).unwrap();
        pool.scale_to(&class, 1).unwrap();

        let remaining: Vec<String> = pool
            .consumer_stats(&class)
            .unwrap()
            .into_iter()
            .map(|s| s.consumer_id)
            .collect();
        assert_eq!(remaining, vec!["consumer-1"]);

        wait_until(|| pool.draining_count(&class).unwrap() == 0).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn retired_consumers_stop_and_deregister() {
        let (pool, state) = pool_with(MockGateway::new());
        let class = QueueClass::priority();

        pool.scale_to(&class, 2).unwrap();
        let monitor = state
            .with_slot(&class, |slot| slot.active[1].monitor().clone())
            .unwrap();
        assert!(monitor.wait_for(WorkerState::Running).await);

        pool.scale_to(&class, 1).unwrap();
        assert!(monitor.wait_for(WorkerState::Stopped).await);
        wait_until(|| pool.draining_count(&class).unwrap() == 0).await;
        assert_eq!(pool.total_count(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn lost_connection_removes_consumer_from_active_set() {
        let gateway = MockGateway::new();
        let (pool, _state) = pool_with(gateway.clone());
        let class = QueueClass::priority();

        pool.scale_to(&class, 2).unwrap();
        gateway.sever(&class);

        wait_until(|| pool.current_count(&class).unwrap() == 0).await;

        gateway.restore(&class);
        assert_eq!(pool.scale_to(&class, 1).unwrap(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_awaits_every_consumer() {
        let (pool, state) = pool_with(MockGateway::new());
        let class = QueueClass::priority();
        pool.scale_to(&class, 3).unwrap();

        pool.shutdown().await;

        assert_eq!(pool.total_count(), 0);
        let leftover = state
            .with_slot(&class, |slot| slot.active.len() + slot.draining.len())
            .unwrap();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn unknown_class_is_rejected() {
        let (pool, _state) = pool_with(MockGateway::new());
        assert!(pool.scale_to(&QueueClass::express(), 1).is_err());
    }
}
