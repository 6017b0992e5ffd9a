// Simulated order processor
// Stands in for real fulfilment work: a fixed delay per order
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use orderpool_core::domain::{MessageEnvelope, QueueClass};
use orderpool_core::port::{OrderProcessor, ProcessingError};

/// Processor that sleeps for a fixed duration and always succeeds
#[derive(Debug, Clone)]
pub struct SimulatedProcessor {
    duration: Duration,
}

impl SimulatedProcessor {
    /// # Example
    /// ```ignore
    /// let processor = SimulatedProcessor::new(config.simulated_processing());
    /// ```
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

#[async_trait]
impl OrderProcessor for SimulatedProcessor {
    async fn process(
        &self,
        class: &QueueClass,
        envelope: &MessageEnvelope,
    ) -> Result<(), ProcessingError> {
        debug!(
            queue = %class,
            order_id = %envelope.order_id,
            customer_id = %envelope.customer_id,
            items = envelope.items.len(),
            "Processing order"
        );

        if !self.duration.is_zero() {
            tokio::time::sleep(self.duration).await;
        }

        debug!(queue = %class, order_id = %envelope.order_id, "Order processed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn envelope() -> MessageEnvelope {
        MessageEnvelope::new("express_4242", "cust_512", vec!["item_3".into()], Utc::now())
    }

    #[tokio::test]
    async fn sleeps_for_configured_duration() {
        let processor = SimulatedProcessor::new(Duration::from_millis(50));
        let start = tokio::time::Instant::now();

        processor
            .process(&QueueClass::express(), &envelope())
            .await
            .unwrap();

        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn zero_duration_completes_immediately() {
        let processor = SimulatedProcessor::new(Duration::ZERO);
        let result =
            tokio_test::block_on(processor.process(&QueueClass::standard(), &envelope()));
        assert!(result.is_ok());
    }
}
