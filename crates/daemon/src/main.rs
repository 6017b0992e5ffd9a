//! Orderpool - Priority-aware autoscaling consumer pools
//! Composition root: logging, config, broker, pools, scheduling loop

mod load_generator;
mod logging;
mod settings;

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use orderpool_core::application::worker::constants::DRAIN_TIMEOUT;
use orderpool_core::application::{
    cancel_channel, MetricsAggregator, PoolManager, SchedulerState, SchedulingLoop, WorkerDeps,
};
use orderpool_core::domain::{by_priority_desc, QueueClass};
use orderpool_core::port::id_provider::UuidProvider;
use orderpool_core::port::time_provider::SystemTimeProvider;
use orderpool_core::port::{BrokerGateway, TimeProvider};
use orderpool_infra_memory::InMemoryBroker;
use orderpool_infra_system::SimulatedProcessor;

use load_generator::LoadGenerator;
use settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration (env + optional JSON file)
    let settings = Settings::from_env().context("invalid configuration")?;

    // 2. Initialize logging; the guard flushes the file sink on exit
    let _log_guard = logging::init(settings.log_format, settings.log_file.as_deref())?;
    info!("Orderpool v{} starting...", orderpool_core::VERSION);

    let config = settings.controller;
    let mut classes: Vec<QueueClass> = config.classes.iter().map(|c| c.queue_class()).collect();
    by_priority_desc(&mut classes);

    // 3. Connect and declare topology; any failure here is fatal
    let broker = InMemoryBroker::connect(&config.broker_host)
        .with_context(|| format!("broker at {} unavailable", config.broker_host))?;
    for class in &classes {
        broker
            .declare_topology(class)
            .await
            .with_context(|| format!("declaring topology for {}", class))?;
    }
    info!(host = %config.broker_host, classes = classes.len(), "Topology declared");

    // 4. Setup dependencies (DI wiring)
    let gateway: Arc<dyn BrokerGateway> = Arc::new(broker);
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let metrics = Arc::new(MetricsAggregator::new());
    let state = Arc::new(SchedulerState::new(classes.iter(), config.latency_history));
    let deps = WorkerDeps {
        gateway: Arc::clone(&gateway),
        processor: Arc::new(SimulatedProcessor::new(config.simulated_processing())),
        metrics: Arc::clone(&metrics),
        state: Arc::clone(&state),
        time_provider: Arc::clone(&time_provider),
    };
    let pool = Arc::new(PoolManager::new(&config.classes, deps, Arc::new(UuidProvider)));

    // 5. Start consumers at their floor, then the scheduling loop
    let controller = SchedulingLoop::new(
        &config,
        Arc::clone(&gateway),
        Arc::clone(&pool),
        metrics,
        state,
    );
    controller.initialize()?;

    let (shutdown_tx, shutdown_rx) = cancel_channel();
    let loop_shutdown = shutdown_rx.clone();
    let loop_handle = tokio::spawn(async move { controller.run(loop_shutdown).await });

    // 6. Optional built-in producer
    let generator = LoadGenerator::new(
        Arc::clone(&gateway),
        classes.clone(),
        settings.load,
        Arc::clone(&time_provider),
    );
    let generator_handle = tokio::spawn(generator.run(shutdown_rx));

    info!(
        mode = ?config.scaling_mode,
        tick_ms = config.tick_interval_ms,
        load = ?settings.load,
        "System ready. Press Ctrl+C to shutdown"
    );

    // 7. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Draining consumers...");

    // 8. Graceful shutdown: stop producing and scaling, then drain consumers
    shutdown_tx.raise();
    if let Err(e) = generator_handle.await {
        warn!(error = %e, "Load generator task failed");
    }
    if let Err(e) = loop_handle.await {
        warn!(error = %e, "Scheduling loop task failed");
    }

    for class in &classes {
        if let Ok(stats) = pool.consumer_stats(class) {
            for s in stats {
                info!(queue = %class, consumer_id = %s.consumer_id, processed = s.processed, "Consumer total");
            }
        }
    }

    if tokio::time::timeout(DRAIN_TIMEOUT, pool.shutdown()).await.is_err() {
        error!(
            timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "Consumers did not drain in time, exiting anyway"
        );
    }

    info!("Shutdown complete.");
    Ok(())
}
