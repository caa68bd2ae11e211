use std::sync::Arc;

use anyhow::Context;

use jobward_queue::{JobService, QueueConfig, QueueStore, TracingAlertSink, TracingProgressSink};
use jobward_worker::handlers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobward_observability::init();

    let config = QueueConfig::from_env().context("invalid JOBWARD_* configuration")?;

    #[cfg(feature = "redis")]
    if let Ok(url) = std::env::var("REDIS_URL") {
        tracing::info!("using redis store");
        let store = jobward_queue::store::RedisQueueStore::new(&url).context("failed to open redis store")?;
        return run(store, config).await;
    }

    tracing::warn!("no persistent store configured; jobs are kept in memory");
    run(jobward_queue::InMemoryQueueStore::arc(), config).await
}

async fn run<S>(store: S, config: QueueConfig) -> anyhow::Result<()>
where
    S: QueueStore + Clone + 'static,
{
    let service = JobService::new(store, Arc::new(TracingAlertSink), Arc::new(TracingProgressSink), config);
    handlers::register_all(&service);

    let mut pools = Vec::new();
    for queue in &service.config().queues {
        let pool = service
            .consume(queue, service.config().worker_concurrency)
            .with_context(|| format!("failed to start workers for queue {queue}"))?;
        pools.push(pool);
    }
    pools.push(service.start_dead_letter_workers().context("failed to start dead-letter workers")?);
    let monitor = service.start_monitor().context("failed to start dead-letter monitor")?;

    tracing::info!(
        queues = ?service.config().queues,
        concurrency = service.config().worker_concurrency,
        dlq_concurrency = service.config().dlq_concurrency,
        "worker started"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested; waiting for running jobs");

    tokio::task::spawn_blocking(move || {
        for pool in pools {
            let name = pool.name().to_string();
            let stats = pool.stats();
            pool.shutdown();
            tracing::info!(
                pool = %name,
                processed = stats.jobs_processed,
                succeeded = stats.jobs_succeeded,
                failed = stats.jobs_failed,
                promoted = stats.entries_promoted,
                "pool stopped"
            );
        }
        monitor.shutdown();
    })
    .await
    .context("shutdown task panicked")?;

    tracing::info!("worker stopped");
    Ok(())
}
