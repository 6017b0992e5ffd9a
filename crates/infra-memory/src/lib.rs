// Orderpool Infrastructure - In-Process Broker
// Implements: BrokerGateway (topic exchange, durable queues, prefetch)

pub mod broker;
pub mod topic;

pub use broker::InMemoryBroker;
pub use topic::topic_matches;
