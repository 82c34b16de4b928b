//! Media fetch worker binary.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vdq_media::{YtDlpConfig, YtDlpExtractor};
use vdq_queue::{JobQueue, RedisProgressRelay, RedisRetryLedger, DEFAULT_RELAY_BUFFER};
use vdq_storage::S3Store;
use vdq_worker::{metrics, JobExecutor, ProcessingContext, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS to Redis and S3)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();

    init_tracing()?;

    info!("Starting vdq-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(addr) = config.metrics_addr.as_deref() {
        metrics::init_metrics(addr)?;
        info!("Serving metrics on {}", addr);
    }

    let queue = Arc::new(JobQueue::from_env().context("Failed to create job queue")?);
    let redis_url = queue.config().redis_url.clone();

    let store = S3Store::from_env()
        .await
        .context("Failed to create artifact store")?;
    if let Err(e) = store.check_connectivity().await {
        warn!("Artifact store not reachable yet: {}", e);
    }
    let ledger = RedisRetryLedger::new(&redis_url, config.retry.retry_ttl)
        .context("Failed to create retry ledger")?;
    let (relay, relay_task) = RedisProgressRelay::start(&redis_url, DEFAULT_RELAY_BUFFER)
        .context("Failed to start progress relay")?;

    let extractor = YtDlpExtractor::new(YtDlpConfig {
        timeout: Some(config.fetch_timeout),
        ..YtDlpConfig::default().with_work_dir(&config.work_dir)
    });

    let ctx = ProcessingContext {
        publisher: queue.clone(),
        ledger: Arc::new(ledger),
        store: Arc::new(store),
        extractor: Arc::new(extractor),
        relay: Arc::new(relay),
    };

    let executor = Arc::new(JobExecutor::new(config, queue, ctx));

    let signal_executor = Arc::clone(&executor);
    let shutdown_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_executor.shutdown();
    });

    if let Err(e) = executor.run().await {
        error!("Executor error: {}", e);
        return Err(e.into());
    }

    shutdown_handle.abort();
    relay_task.abort();

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("vdq=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
    Ok(())
}
