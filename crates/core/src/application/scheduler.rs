//! Scheduling loop - samples queue depths and resizes pools every tick
//!
//! Per tick:
//! 0. reconcile pools that fell below their floor (lost connections)
//! 1. sample every class depth
//! 2. apply the scaling policy, highest priority rank first
//! 3. flush the metrics window and emit one record per class

use crate::application::metrics::{MetricsAggregator, MetricsRecord};
use crate::application::policy::{ClassObservation, ScaleDecision, ScalingPolicy};
use crate::application::pool::PoolManager;
use crate::application::state::SchedulerState;
use crate::application::worker::constants::METRICS_TARGET;
use crate::application::worker::CancelToken;
use crate::config::{ClassConfig, ControllerConfig, ScalingMode};
use crate::error::Result;
use crate::port::BrokerGateway;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Outcome of one tick for one class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTick {
    pub class: String,
    /// None when the depth query failed
    pub backlog_depth: Option<u64>,
    /// None when no decision was taken (failed query or fixed mode)
    pub decision: Option<ScaleDecision>,
    /// Active consumers after the decision was applied
    pub consumers: usize,
}

/// Everything a tick did, in priority order
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub classes: Vec<ClassTick>,
    pub records: Vec<MetricsRecord>,
}

impl TickReport {
    pub fn class(&self, name: &str) -> Option<&ClassTick> {
        self.classes.iter().find(|c| c.class == name)
    }

    pub fn record(&self, name: &str) -> Option<&MetricsRecord> {
        self.records.iter().find(|r| r.queue_class.name() == name)
    }
}

/// Periodic controller driving every class pool
pub struct SchedulingLoop {
    classes: Vec<ClassConfig>,
    mode: ScalingMode,
    tick_interval: Duration,
    policy: ScalingPolicy,
    gateway: Arc<dyn BrokerGateway>,
    pool: Arc<PoolManager>,
    metrics: Arc<MetricsAggregator>,
    state: Arc<SchedulerState>,
}

impl SchedulingLoop {
    pub fn new(
        config: &ControllerConfig,
        gateway: Arc<dyn BrokerGateway>,
        pool: Arc<PoolManager>,
        metrics: Arc<MetricsAggregator>,
        state: Arc<SchedulerState>,
    ) -> Self {
        Self {
            classes: config.classes_by_priority(),
            mode: config.scaling_mode,
            tick_interval: config.tick_interval(),
            policy: ScalingPolicy::from_config(config),
            gateway,
            pool,
            metrics,
            state,
        }
    }

    /// Pool size a class never drops below: min in adaptive mode, max in fixed
    fn floor(&self, class: &ClassConfig) -> usize {
        match self.mode {
            ScalingMode::Adaptive => class.min_consumers,
            ScalingMode::Fixed => class.max_consumers,
        }
    }

    /// Bring every pool to its floor before the first tick
    pub fn initialize(&self) -> Result<()> {
        for class in &self.classes {
            let target = self.pool.scale_to(&class.queue_class(), self.floor(class))?;
            info!(queue = %class.queue_class(), consumers = target, mode = ?self.mode, "Pool initialized");
        }
        Ok(())
    }

    /// Run one scheduling pass. Failures are contained to the class they hit.
    pub async fn tick(&self) -> TickReport {
        self.reconcile();

        let mut depths = Vec::with_capacity(self.classes.len());
        for class in &self.classes {
            let queue_class = class.queue_class();
            let depth = match self.gateway.query_depth(&queue_class).await {
                Ok(depth) => match self.state.update_depth(&queue_class, depth) {
                    Ok(()) => Some(depth),
                    Err(e) => {
                        warn!(queue = %queue_class, error = %e, "Could not store depth");
                        None
                    }
                },
                Err(e) => {
                    warn!(queue = %queue_class, error = %e, "Depth query failed, skipping class this tick");
                    None
                }
            };
            depths.push(depth);
        }

        let mut report = TickReport::default();
        for (class, depth) in self.classes.iter().zip(depths) {
            let decision = match (self.mode, depth) {
                (ScalingMode::Adaptive, Some(depth)) => Some(self.apply_policy(class, depth)),
                _ => None,
            };
            report.classes.push(ClassTick {
                class: class.name.clone(),
                backlog_depth: depth,
                decision,
                consumers: self.pool.current_count(&class.queue_class()).unwrap_or(0),
            });
        }

        report.records = self.flush_metrics();
        report
    }

    fn reconcile(&self) {
        for class in &self.classes {
            let queue_class = class.queue_class();
            let floor = self.floor(class);
            match self.pool.current_count(&queue_class) {
                Ok(current) if current < floor => {
                    info!(
                        queue = %queue_class,
                        current,
                        floor,
                        "Pool below floor, replenishing consumers"
                    );
                    if let Err(e) = self.pool.scale_to(&queue_class, floor) {
                        warn!(queue = %queue_class, error = %e, "Replenish failed");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(queue = %queue_class, error = %e, "Could not read pool size"),
            }
        }
    }

    fn apply_policy(&self, class: &ClassConfig, depth: u64) -> ScaleDecision {
        let queue_class = class.queue_class();
        let current = match self.pool.current_count(&queue_class) {
            Ok(current) => current,
            Err(e) => {
                warn!(queue = %queue_class, error = %e, "Could not read pool size");
                return ScaleDecision::Hold;
            }
        };
        let empty_ticks = self
            .state
            .status(&queue_class)
            .map(|s| s.empty_ticks)
            .unwrap_or(0);

        let observed = ClassObservation {
            backlog_depth: depth,
            consumers: current,
            empty_ticks,
        };
        let decision = self.policy.decide(class, observed, self.pool.total_count());

        let target = match decision {
            ScaleDecision::ScaleUp => current + 1,
            ScaleDecision::ScaleDown => current.saturating_sub(1),
            ScaleDecision::Hold => return decision,
        };
        info!(
            queue = %queue_class,
            depth,
            from = current,
            to = target,
            decision = ?decision,
            "Scaling decision"
        );
        if let Err(e) = self.pool.scale_to(&queue_class, target) {
            warn!(queue = %queue_class, error = %e, "Scaling failed");
        }
        if decision == ScaleDecision::ScaleDown {
            if let Err(e) = self.state.reset_empty_ticks(&queue_class) {
                warn!(queue = %queue_class, error = %e, "Could not reset empty streak");
            }
        }
        decision
    }

    fn flush_metrics(&self) -> Vec<MetricsRecord> {
        let mut records = Vec::with_capacity(self.classes.len());
        for class in &self.classes {
            let queue_class = class.queue_class();
            let snapshot = self.metrics.snapshot(&queue_class);
            let status = self.state.status(&queue_class).unwrap_or_default();
            let consumers = self.pool.current_count(&queue_class).unwrap_or(0);

            let record = MetricsRecord {
                queue_class: queue_class.clone(),
                avg_latency: snapshot.avg_latency,
                throughput: snapshot.throughput_per_sec(self.tick_interval),
                consumers,
                backlog_depth: status.backlog_depth,
            };
            info!(
                target: METRICS_TARGET,
                queue = %queue_class,
                consumers,
                backlog = status.backlog_depth,
                "{}",
                record
            );
            debug!(
                queue = %queue_class,
                depth = status.backlog_depth,
                consumers,
                mean_recent_latency_ms = status.mean_recent_latency().as_millis() as u64,
                "Queue status"
            );
            records.push(record);
        }
        records
    }

    /// Tick every `tick_interval` until `shutdown` is raised.
    ///
    /// The first tick fires one interval after start; `initialize` covers
    /// the pools until then.
    pub async fn run(&self, mut shutdown: CancelToken) {
        info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            mode = ?self.mode,
            classes = self.classes.len(),
            "Scheduling loop started"
        );

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.raised() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("Scheduling loop stopped");
    }
}
