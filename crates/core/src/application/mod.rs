// Application Layer - Consumers, pools and the scheduling loop

pub mod metrics;
pub mod policy;
pub mod pool;
pub mod scheduler;
pub mod state;
pub mod worker;

// Re-exports
pub use metrics::{MetricsAggregator, MetricsRecord, MetricsSample, WindowSnapshot};
pub use policy::{ClassObservation, ScaleDecision, ScalingPolicy};
pub use pool::{ConsumerHandle, ConsumerStats, PoolManager};
pub use scheduler::{ClassTick, SchedulingLoop, TickReport};
pub use state::{QueueStatus, SchedulerState};
pub use worker::{
    cancel_channel, CancelSignal, CancelToken, ConsumerWorker, WorkerDeps, WorkerExit,
    WorkerMonitor, WorkerState,
};
