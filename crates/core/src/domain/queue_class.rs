// Queue Class Domain Model

use serde::{Deserialize, Serialize};
use std::fmt;

/// Topic exchange every order queue is bound to
pub const ORDER_EXCHANGE: &str = "order_exchange";

/// Priority rank (higher number = more urgent)
pub type PriorityRank = u8;

/// Logical order class: one durable queue and one consumer pool each.
///
/// Immutable once the controller starts. The rank totally orders classes
/// and decides which class the scheduling loop evaluates first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueClass {
    name: String,
    routing_key: String,
    priority_rank: PriorityRank,
}

impl QueueClass {
    pub fn new(name: impl Into<String>, priority_rank: PriorityRank) -> Self {
        let name = name.into();
        Self {
            routing_key: format!("order.{}", name),
            name,
            priority_rank,
        }
    }

    pub fn priority() -> Self {
        Self::new("priority", 3)
    }

    pub fn express() -> Self {
        Self::new("express", 2)
    }

    pub fn standard() -> Self {
        Self::new("standard", 1)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn priority_rank(&self) -> PriorityRank {
        self.priority_rank
    }

    /// Durable queue backing this class (`priority` -> `priority_orders`)
    pub fn queue_name(&self) -> String {
        format!("{}_orders", self.name)
    }
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.queue_name())
    }
}

/// Sort classes most urgent first (ties broken by name for determinism)
pub fn by_priority_desc(classes: &mut [QueueClass]) {
    classes.sort_by(|a, b| {
        b.priority_rank
            .cmp(&a.priority_rank)
            .then_with(|| a.name.cmp(&b.name))
    });
}
