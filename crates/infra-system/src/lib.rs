// Orderpool Infrastructure - Processing Adapters
// Implements: OrderProcessor

pub mod simulated_processor;

pub use simulated_processor::SimulatedProcessor;
