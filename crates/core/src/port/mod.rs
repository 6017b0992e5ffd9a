// Port Layer - Interfaces for external dependencies

pub mod broker_gateway;
pub mod id_provider; // For deterministic testing
pub mod order_processor;
pub mod time_provider;

// Re-exports
pub use broker_gateway::{AckHandle, BrokerError, BrokerGateway, Delivery, DeliveryStream, DeliveryTag};
pub use id_provider::IdProvider;
pub use order_processor::{OrderProcessor, ProcessingError};
pub use time_provider::TimeProvider;
