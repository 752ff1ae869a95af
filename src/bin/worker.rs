use predict_jobs::{
    config::AppConfig,
    db,
    routes,
    services::{
        predictor::LinearPriceModel,
        queue::{QueueSettings, RedisWorkQueue},
        reconcile::Reconciler,
        store::PgJobStore,
        worker::{BatchWorker, WorkerConfig},
    },
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting prediction batch worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid worker metrics address");
    routes::metrics::install_exporter(metrics_addr).expect("Failed to install metrics exporter");
    tracing::info!(addr = %metrics_addr, "Serving worker metrics");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.store_timeout())
        .await
        .expect("Failed to connect to database");
    let store = Arc::new(PgJobStore::new(
        db_pool,
        config.store_batch_limit,
        config.store_timeout(),
    ));

    let queue = Arc::new(
        RedisWorkQueue::new(&config.redis_url, &config.queue_name, QueueSettings::from(&config))
            .expect("Failed to initialize work queue"),
    );

    let model = match &config.model_path {
        Some(path) => {
            tracing::info!(path = %path, "Loading model coefficients");
            LinearPriceModel::from_file(path).expect("Failed to load model coefficients")
        }
        None => LinearPriceModel::default(),
    };

    let worker = BatchWorker::new(
        store.clone(),
        queue.clone(),
        Arc::new(model),
        WorkerConfig::from(&config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler_task = (config.reconcile_interval_secs > 0).then(|| {
        let reconciler = Reconciler::new(
            store.clone(),
            queue.clone(),
            Duration::from_secs(config.reconcile_after_secs),
            config.reconcile_batch_limit,
        );
        let interval = Duration::from_secs(config.reconcile_interval_secs);
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { reconciler.run(interval, rx).await })
    });

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, abandoning in-flight batch");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!("Worker ready, starting batch loop");
    worker.run(shutdown_rx).await;

    if let Some(task) = reconciler_task {
        let _ = task.await;
    }
}
