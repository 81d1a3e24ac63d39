use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{routing::get, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use telemetry_ingestor::cache::memory::MemoryCache;
use telemetry_ingestor::cache::{Cache, DeviceDirectory};
use telemetry_ingestor::channel::memory::MemoryBroker;
use telemetry_ingestor::channel::mqtt::{MqttConsumer, MqttProducer, MqttSettings};
use telemetry_ingestor::channel::{ChannelConsumer, ChannelProducer};
use telemetry_ingestor::clock::SystemClock;
use telemetry_ingestor::config::{ChannelBackend, Config};
use telemetry_ingestor::db::{self, PgDeviceStore, PgTelemetryStore};
use telemetry_ingestor::ingest::Ingestion;
use telemetry_ingestor::metrics;
use telemetry_ingestor::publisher::Publisher;
use telemetry_ingestor::rest::{self, AppState};
use telemetry_ingestor::store::TelemetryStore;
use telemetry_ingestor::worker::{IngestWorker, WorkerConfig, WorkerStats};

const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("Invalid configuration")?;

    info!("Starting telemetry ingestor");
    info!("Role: {:?}, channel: {:?}", config.role, config.channel);
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_host());

    metrics::init_metrics().context("Failed to register metrics")?;

    let pool = db::make_pool(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;
    let telemetry: Arc<dyn TelemetryStore> = Arc::new(PgTelemetryStore::new(pool.clone()));

    let cancel = CancellationToken::new();
    let broker = (config.channel == ChannelBackend::Memory).then(MemoryBroker::default);

    let mut workers = Vec::new();
    if config.role.runs_workers() {
        let worker_config = WorkerConfig {
            drain_timeout: config.drain_timeout,
            ..WorkerConfig::default()
        };
        info!("Spawning {} ingest worker(s) in group {}", config.worker_instances, config.consumer_group);

        for i in 0..config.worker_instances {
            let name = format!("worker-{i}");
            let handle = match &broker {
                Some(broker) => spawn_worker(
                    IngestWorker::new(
                        name,
                        broker.consumer(config.topic.as_str(), config.consumer_group.as_str()),
                        telemetry.clone(),
                        worker_config.clone(),
                    ),
                    cancel.clone(),
                ),
                None => {
                    let settings = mqtt_settings(&config, format!("{}-{}", config.mqtt_client_id, name));
                    spawn_worker(
                        IngestWorker::new(
                            name,
                            MqttConsumer::new(&settings, &config.consumer_group),
                            telemetry.clone(),
                            worker_config.clone(),
                        ),
                        cancel.clone(),
                    )
                }
            };
            workers.push(handle);
        }
    }

    let mut app = Router::new().route("/metrics", get(metrics_handler));
    if config.role.serves_api() {
        let producer: Arc<dyn ChannelProducer> = match &broker {
            Some(broker) => Arc::new(broker.producer(config.topic.as_str())),
            None => Arc::new(MqttProducer::connect(
                &mqtt_settings(&config, format!("{}-publisher", config.mqtt_client_id)),
                config.publish_timeout,
            )),
        };
        let cache = build_cache(&config, &cancel).await?;
        let devices = DeviceDirectory::new(
            Arc::new(PgDeviceStore::new(pool.clone())),
            cache,
            config.cache_ttl,
        );
        let publisher = Publisher::new(producer, Arc::new(SystemClock));
        let state = AppState {
            ingestion: Arc::new(Ingestion::new(Arc::new(devices), publisher)),
            store: telemetry.clone(),
        };
        app = app.merge(rest::create_router(state));
    }

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.http_addr))?;
    info!("HTTP server listening on {}", config.http_addr);

    let shutdown = cancel.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    let server_exited = tokio::select! {
        result = &mut server => {
            match result {
                Ok(Ok(())) => error!("HTTP server terminated"),
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("HTTP server task failed: {}", e),
            }
            true
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            false
        }
    };

    info!("Shutting down");
    cancel.cancel();

    for (i, handle) in workers.into_iter().enumerate() {
        match handle.await {
            Ok(stats) => info!(
                "worker-{} drained: {} persisted, {} skipped, {} retried",
                i, stats.persisted, stats.skipped, stats.retried
            ),
            Err(e) => error!("worker-{} task failed: {}", i, e),
        }
    }

    if !server_exited {
        if let Ok(Err(e)) = server.await {
            error!("HTTP server error during shutdown: {}", e);
        }
    }

    pool.close().await;
    info!("Shutdown complete");
    Ok(())
}

fn spawn_worker<C>(worker: IngestWorker<C>, cancel: CancellationToken) -> JoinHandle<WorkerStats>
where
    C: ChannelConsumer + 'static,
{
    tokio::spawn(worker.run(cancel))
}

fn mqtt_settings(config: &Config, client_id: String) -> MqttSettings {
    MqttSettings {
        broker: config.mqtt_broker.clone(),
        port: config.mqtt_port,
        client_id,
        topic: config.topic.clone(),
        keep_alive: MQTT_KEEP_ALIVE,
    }
}

#[cfg(feature = "redis-cache")]
async fn build_cache(config: &Config, cancel: &CancellationToken) -> anyhow::Result<Arc<dyn Cache>> {
    use telemetry_ingestor::cache::redis::RedisCache;

    match &config.redis_url {
        Some(url) => {
            let cache = RedisCache::connect(url)
                .await
                .context("Failed to connect to Redis")?;
            Ok(Arc::new(cache))
        }
        None => Ok(memory_cache(config, cancel)),
    }
}

#[cfg(not(feature = "redis-cache"))]
async fn build_cache(config: &Config, cancel: &CancellationToken) -> anyhow::Result<Arc<dyn Cache>> {
    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL is set but the redis-cache feature is disabled; using in-process cache");
    }
    Ok(memory_cache(config, cancel))
}

fn memory_cache(config: &Config, cancel: &CancellationToken) -> Arc<dyn Cache> {
    let cache = Arc::new(MemoryCache::default());
    let purge_every = config.cache_ttl.max(Duration::from_secs(1));
    let purging = cache.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(purge_every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = purging.purge_expired();
                    if purged > 0 {
                        tracing::debug!("Purged {} expired cache entries", purged);
                    }
                }
            }
        }
    });
    cache
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
