// Shared wiring for end-to-end scenarios
#![allow(dead_code)]

use chrono::{TimeDelta, Utc};
use orderpool_core::application::{
    MetricsAggregator, PoolManager, SchedulerState, SchedulingLoop, WorkerDeps,
};
use orderpool_core::config::ControllerConfig;
use orderpool_core::domain::{MessageEnvelope, QueueClass};
use orderpool_core::port::id_provider::mocks::SequentialIdProvider;
use orderpool_core::port::time_provider::SystemTimeProvider;
use orderpool_core::port::{BrokerGateway, OrderProcessor};
use orderpool_infra_memory::InMemoryBroker;
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub broker: InMemoryBroker,
    pub pool: Arc<PoolManager>,
    pub metrics: Arc<MetricsAggregator>,
    pub state: Arc<SchedulerState>,
    pub controller: SchedulingLoop,
}

impl Harness {
    pub async fn new(config: ControllerConfig, processor: Arc<dyn OrderProcessor>) -> Self {
        let broker = InMemoryBroker::connect(&config.broker_host).unwrap();
        let classes: Vec<QueueClass> = config.classes.iter().map(|c| c.queue_class()).collect();
        for class in &classes {
            broker.declare_topology(class).await.unwrap();
        }

        let gateway: Arc<dyn BrokerGateway> = Arc::new(broker.clone());
        let metrics = Arc::new(MetricsAggregator::new());
        let state = Arc::new(SchedulerState::new(classes.iter(), config.latency_history));
        let deps = WorkerDeps {
            gateway: Arc::clone(&gateway),
            processor,
            metrics: Arc::clone(&metrics),
            state: Arc::clone(&state),
            time_provider: Arc::new(SystemTimeProvider),
        };
        let pool = Arc::new(PoolManager::new(
            &config.classes,
            deps,
            Arc::new(SequentialIdProvider::default()),
        ));
        let controller = SchedulingLoop::new(
            &config,
            gateway,
            Arc::clone(&pool),
            Arc::clone(&metrics),
            Arc::clone(&state),
        );

        Self {
            broker,
            pool,
            metrics,
            state,
            controller,
        }
    }

    pub fn consumers(&self, class: &QueueClass) -> usize {
        self.pool.current_count(class).unwrap()
    }

    /// Publish `count` orders created `age` ago
    pub async fn publish_aged(&self, class: &QueueClass, count: usize, age: Duration) {
        let created = Utc::now() - TimeDelta::from_std(age).unwrap();
        for n in 0..count {
            let order = MessageEnvelope::new(
                format!("{}_{}", class.name(), 1000 + n),
                "cust_100",
                vec!["item_1".into()],
                created,
            );
            self.broker.publish(class, &order).await.unwrap();
        }
    }

    pub async fn publish(&self, class: &QueueClass, count: usize) {
        self.publish_aged(class, count, Duration::ZERO).await;
    }

    pub async fn depth(&self, class: &QueueClass) -> u64 {
        self.broker.query_depth(class).await.unwrap()
    }
}

/// Poll `check` every 10ms for up to 2s
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}
