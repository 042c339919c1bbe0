use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use pressroom_infra::ann::{AnnIndexClient, HttpVectorService};
use pressroom_infra::db::PostgresStore;
use pressroom_infra::jobs::{JobDispatcher, JobRecoverer, RedisJobQueue};
use pressroom_infra::workers::{
    DETECT_DUPLICATES_JOB, DuplicateDetector, INDEX_VECTOR_JOB, IndexRetention, VectorIndexer,
};

mod settings;

use settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("failed to load settings")?;
    pressroom_observability::init_with(settings.log_format);

    let pool = PgPoolOptions::new()
        .max_connections(settings.db_max_connections)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PostgresStore::new(pool));

    let queue = Arc::new(
        RedisJobQueue::connect(&settings.redis_url, settings.queue.clone())
            .await
            .context("failed to connect to Redis")?,
    );

    let service = HttpVectorService::with_timeout(&settings.ann_url, settings.ann_timeout)?;
    let ann = Arc::new(AnnIndexClient::new(service, settings.ann.clone())?);

    let mut dispatcher = JobDispatcher::new(queue.clone(), settings.dispatcher.clone());
    dispatcher.register(
        INDEX_VECTOR_JOB,
        VectorIndexer::new(store.clone(), ann.clone(), queue.clone())
            .with_follow_up_queue(settings.dispatcher.queue.as_str()),
    );
    dispatcher.register(
        DETECT_DUPLICATES_JOB,
        DuplicateDetector::new(
            store.clone(),
            ann.clone(),
            queue.clone(),
            settings.detection.clone(),
        )
        .with_follow_up_queue(settings.dispatcher.queue.as_str()),
    );
    let dispatcher = Arc::new(dispatcher);

    let recoverer = JobRecoverer::new(store.clone(), queue.clone(), settings.recoverer.clone());

    let cancel = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            let stats = dispatcher.run(cancel).await;
            tracing::info!(
                processed = stats.jobs_processed,
                succeeded = stats.jobs_succeeded,
                dead_lettered = stats.jobs_dead_lettered,
                "dispatcher stopped"
            );
        }
    });

    tasks.spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = recoverer.run(cancel.clone()).await {
                tracing::error!(error = %e, "job recoverer stopped");
                cancel.cancel();
            }
        }
    });

    if let Some(config) = settings.retention.clone() {
        let retention = IndexRetention::new(ann.clone(), config);
        let cancel = cancel.clone();
        tasks.spawn(async move { retention.run(cancel).await });
    }

    tracing::info!(
        queue = %settings.dispatcher.queue,
        concurrency = settings.dispatcher.concurrency,
        ann_prefix = %settings.ann.prefix,
        "pressroom worker started"
    );

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown requested");
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            tracing::error!(error = %e, "background task panicked");
        }
    }

    Ok(())
}
