// Order Processor Port
// The externally supplied per-message processing function

use crate::domain::{MessageEnvelope, QueueClass};
use async_trait::async_trait;
use thiserror::Error;

/// Processing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("Processing failed: {0}")]
    Failed(String),
}

/// Order processor trait
///
/// Implementations:
/// - SimulatedProcessor (orderpool-infra-system): sleeps for a fixed time
/// - mocks::MockProcessor: scripted behaviour for tests
///
/// There is no timeout around `process`; a stuck call stalls only the
/// consumer that issued it.
#[async_trait]
pub trait OrderProcessor: Send + Sync {
    async fn process(
        &self,
        class: &QueueClass,
        envelope: &MessageEnvelope,
    ) -> Result<(), ProcessingError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Mock processor behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Always succeed immediately
        Success,
        /// Succeed after sleeping
        Delay(Duration),
        /// Always fail with message
        Fail(String),
        /// Panic with message (for panic isolation testing)
        Panic(String),
        /// Signal `started`, then block until `release` is notified
        Gated {
            started: Arc<Notify>,
            release: Arc<Notify>,
        },
    }

    /// Mock Order Processor for testing
    pub struct MockProcessor {
        behavior: MockBehavior,
        call_count: AtomicUsize,
    }

    impl MockProcessor {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior,
                call_count: AtomicUsize::new(0),
            }
        }

        pub fn new_success() -> Self {
            Self::new(MockBehavior::Success)
        }

        pub fn new_delay(delay: Duration) -> Self {
            Self::new(MockBehavior::Delay(delay))
        }

        pub fn new_fail(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Fail(message.into()))
        }

        pub fn new_panic_inducing(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Panic(message.into()))
        }

        /// Returns the processor plus its (started, release) notifiers
        pub fn new_gated() -> (Self, Arc<Notify>, Arc<Notify>) {
            let started = Arc::new(Notify::new());
            let release = Arc::new(Notify::new());
            let processor = Self::new(MockBehavior::Gated {
                started: Arc::clone(&started),
                release: Arc::clone(&release),
            });
            (processor, started, release)
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OrderProcessor for MockProcessor {
        async fn process(
            &self,
            _class: &QueueClass,
            _envelope: &MessageEnvelope,
        ) -> Result<(), ProcessingError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);

            match &self.behavior {
                MockBehavior::Success => Ok(()),
                MockBehavior::Delay(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(())
                }
                MockBehavior::Fail(msg) => Err(ProcessingError::Failed(msg.clone())),
                MockBehavior::Panic(msg) => {
                    panic!("{}", msg); // Actually panic for panic isolation testing
                }
                MockBehavior::Gated { started, release } => {
                    started.notify_one();
                    release.notified().await;
                    Ok(())
                }
            }
        }
    }
}
