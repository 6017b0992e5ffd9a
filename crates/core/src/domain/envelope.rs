// Message Envelope Domain Model

use chrono::{DateTime, Utc};

/// Order identifier assigned by the producer
pub type OrderId = String;

/// Customer identifier
pub type CustomerId = String;

/// Decoded order message.
///
/// `timestamp` is the producer-side creation time and the reference point
/// for end-to-end latency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub items: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        items: Vec<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            customer_id: customer_id.into(),
            items,
            timestamp,
        }
    }

    /// Age of the envelope at `now`.
    ///
    /// Returns `(latency, clock_skew)`; a timestamp in the future (producer
    /// clock ahead of ours) clamps to zero and sets the skew flag.
    pub fn latency_at(&self, now: DateTime<Utc>) -> (std::time::Duration, bool) {
        match (now - self.timestamp).to_std() {
            Ok(latency) => (latency, false),
            Err(_) => (std::time::Duration::ZERO, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn envelope_at(ts: DateTime<Utc>) -> MessageEnvelope {
        MessageEnvelope::new("priority_1234", "cust_100", vec!["item_1".into()], ts)
    }

    #[test]
    fn latency_is_age_of_timestamp() {
        let now = Utc::now();
        let env = envelope_at(now - TimeDelta::milliseconds(2_000));

        let (latency, skew) = env.latency_at(now);
        assert_eq!(latency, std::time::Duration::from_secs(2));
        assert!(!skew);
    }

    #[test]
    fn future_timestamp_clamps_to_zero_and_flags_skew() {
        let now = Utc::now();
        let env = envelope_at(now + TimeDelta::milliseconds(750));

        let (latency, skew) = env.latency_at(now);
        assert_eq!(latency, std::time::Duration::ZERO);
        assert!(skew);
    }
}
