//! BoomPoW worker.
//!
//! Connects to a broker, keeps a bounded backlog of work requests, and
//! computes them with a fixed number of consumers. Results are validated
//! locally before they are sent back.

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod processor;
pub mod queue;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use bpow_utils::ShutdownController;

pub use client::{MessageHandler, RequestFilter, WorkerClient};
pub use config::WorkerConfig;
pub use engine::{CpuEngine, EnginePool, WorkEngine};
pub use error::WorkerError;
pub use processor::{ProcessorSettings, WorkProcessor};
pub use queue::{QueueKey, Queued, RandomAccessQueue};

/// Run a CPU worker until `shutdown` fires.
pub async fn run(config: &WorkerConfig, shutdown: &ShutdownController) -> Result<(), WorkerError> {
    config.validate()?;
    let engine = EnginePool::cpu(config.cpu_threads)?;
    info!(
        engines = ?engine.names(),
        concurrency = config.concurrency,
        url = %config.server_url,
        "starting worker"
    );
    run_with_engine(config, Arc::new(engine), shutdown).await
}

/// Same as [`run`] with a caller-supplied engine.
pub async fn run_with_engine(
    config: &WorkerConfig,
    engine: Arc<dyn WorkEngine>,
    shutdown: &ShutdownController,
) -> Result<(), WorkerError> {
    let settings = ProcessorSettings {
        concurrency: config.concurrency,
        queue_capacity: config.queue_capacity,
        compute_timeout: config.compute_timeout(),
    };
    let (results_tx, results_rx) = mpsc::channel(config.queue_capacity.max(1));
    let processor = Arc::new(WorkProcessor::new(engine, settings, results_tx));
    let client = WorkerClient::new(config, processor.clone(), results_rx)?;

    let consumers = processor.spawn(shutdown);
    client.run(shutdown.subscribe()).await;
    for consumer in consumers {
        let _ = consumer.await;
    }
    Ok(())
}
