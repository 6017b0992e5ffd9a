// Built-in order producer for demos and soak runs

use crate::settings::LoadMode;
use chrono::{DateTime, Utc};
use orderpool_core::application::CancelToken;
use orderpool_core::domain::{MessageEnvelope, QueueClass};
use orderpool_core::port::{BrokerGateway, TimeProvider};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Time between spike starts
pub const SPIKE_EVERY: Duration = Duration::from_secs(30);
pub const SPIKE_LENGTH: Duration = Duration::from_secs(5);
pub const SPIKE_SPACING: Duration = Duration::from_millis(100);
const STEADY_SPACING_MS: std::ops::RangeInclusive<u64> = 500..=2_000;

/// Random order for `class`: `<class>_<1000..9999>`, `cust_<100..999>`,
/// one to three `item_<1..5>` entries
pub fn random_order(class: &QueueClass, rng: &mut impl Rng, now: DateTime<Utc>) -> MessageEnvelope {
    let item_count = rng.gen_range(1..=3);
    let items = (0..item_count)
        .map(|_| format!("item_{}", rng.gen_range(1..=5)))
        .collect();
    MessageEnvelope::new(
        format!("{}_{}", class.name(), rng.gen_range(1000..=9999)),
        format!("cust_{}", rng.gen_range(100..=999)),
        items,
        now,
    )
}

pub struct LoadGenerator {
    gateway: Arc<dyn BrokerGateway>,
    classes: Vec<QueueClass>,
    mode: LoadMode,
    time_provider: Arc<dyn TimeProvider>,
    rng: StdRng,
}

impl LoadGenerator {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        classes: Vec<QueueClass>,
        mode: LoadMode,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            gateway,
            classes,
            mode,
            time_provider,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic order contents (for tests)
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Publish one random order to a random class; false if publishing failed
    pub async fn publish_one(&mut self) -> bool {
        let class = self.classes[self.rng.gen_range(0..self.classes.len())].clone();
        let order = random_order(&class, &mut self.rng, self.time_provider.now());

        match self.gateway.publish(&class, &order).await {
            Ok(()) => {
                debug!(queue = %class, order_id = %order.order_id, items = order.items.len(), "Sent order");
                true
            }
            Err(e) => {
                warn!(queue = %class, order_id = %order.order_id, error = %e, "Publish failed");
                false
            }
        }
    }

    fn steady_gap(&mut self) -> Duration {
        Duration::from_millis(self.rng.gen_range(STEADY_SPACING_MS))
    }

    /// Produce orders until `shutdown` is raised
    pub async fn run(mut self, mut shutdown: CancelToken) {
        if self.mode == LoadMode::Off || self.classes.is_empty() {
            info!("Load generator disabled");
            return;
        }
        info!(mode = ?self.mode, classes = self.classes.len(), "Load generator started");

        let mut last_spike: Option<Instant> = None;
        'produce: loop {
            if shutdown.is_raised() {
                break;
            }

            let now = Instant::now();
            let spike_due = self.mode == LoadMode::Spiked
                && last_spike.map_or(true, |started| now.duration_since(started) >= SPIKE_EVERY);

            if spike_due {
                info!(length_secs = SPIKE_LENGTH.as_secs(), "Spike started");
                let end = now + SPIKE_LENGTH;
                let mut sent = 0u64;
                while Instant::now() < end {
                    if self.publish_one().await {
                        sent += 1;
                    }
                    if !pause(SPIKE_SPACING, &mut shutdown).await {
                        break 'produce;
                    }
                }
                info!(sent, "Spike ended");
                last_spike = Some(now);
            } else {
                self.publish_one().await;
                let gap = self.steady_gap();
                if !pause(gap, &mut shutdown).await {
                    break;
                }
            }
        }
        info!("Load generator stopped");
    }
}

/// Sleep for `duration`; false if shutdown was raised first
async fn pause(duration: Duration, shutdown: &mut CancelToken) -> bool {
    tokio::select! {
        _ = shutdown.raised() => false,
        _ = sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orderpool_core::application::cancel_channel;
    use orderpool_core::port::broker_gateway::mocks::MockGateway;
    use orderpool_core::port::time_provider::SystemTimeProvider;

    #[test]
    fn random_orders_follow_naming_scheme() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let order = random_order(&QueueClass::express(), &mut rng, Utc::now());

            let suffix: u32 = order.order_id.strip_prefix("express_").unwrap().parse().unwrap();
            assert!((1000..=9999).contains(&suffix));
            let customer: u32 = order.customer_id.strip_prefix("cust_").unwrap().parse().unwrap();
            assert!((100..=999).contains(&customer));
            assert!((1..=3).contains(&order.items.len()));
            assert!(order
                .items
                .iter()
                .all(|i| ["item_1", "item_2", "item_3", "item_4", "item_5"].contains(&i.as_str())));
        }
    }

    #[tokio::test]
    async fn spiked_mode_bursts_then_stops_on_shutdown() {
        let gateway = MockGateway::new();
        let classes = vec![QueueClass::priority(), QueueClass::express(), QueueClass::standard()];
        let generator = LoadGenerator::new(
            Arc::new(gateway.clone()),
            classes.clone(),
            LoadMode::Spiked,
            Arc::new(SystemTimeProvider),
        )
        .with_seed(42);
        let (signal, token) = cancel_channel();

        let task = tokio::spawn(generator.run(token));
        sleep(Duration::from_millis(550)).await;
        signal.raise();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();

        let mut published = 0;
        for class in &classes {
            published += gateway.query_depth(class).await.unwrap();
        }
        assert!(published >= 3, "burst should publish every 100ms, got {}", published);
    }

    #[tokio::test]
    async fn off_mode_publishes_nothing() {
        let gateway = MockGateway::new();
        let generator = LoadGenerator::new(
            Arc::new(gateway.clone()),
            vec![QueueClass::standard()],
            LoadMode::Off,
            Arc::new(SystemTimeProvider),
        );
        let (_signal, token) = cancel_channel();

        generator.run(token).await;
        assert_eq!(gateway.query_depth(&QueueClass::standard()).await.unwrap(), 0);
    }
}
