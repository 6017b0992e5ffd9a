// Domain Layer - Pure business logic and entities

pub mod codec;
pub mod envelope;
pub mod error;
pub mod queue_class;

// Re-exports
pub use envelope::{CustomerId, MessageEnvelope, OrderId};
pub use error::DomainError;
pub use queue_class::{by_priority_desc, PriorityRank, QueueClass, ORDER_EXCHANGE};
