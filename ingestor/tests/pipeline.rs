//! End-to-end runs of submit -> channel -> worker -> store on the in-process
//! broker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use telemetry_ingestor::cache::memory::MemoryCache;
use telemetry_ingestor::cache::{DeviceDirectory, DEFAULT_TTL};
use telemetry_ingestor::channel::memory::{MemoryBroker, MemoryConsumer};
use telemetry_ingestor::channel::{ChannelConsumer, ChannelProducer};
use telemetry_ingestor::clock::ManualClock;
use telemetry_ingestor::ingest::Ingestion;
use telemetry_ingestor::model::{
    Device, PageRequest, PagedResult, TelemetryMessage, TelemetryReading, TelemetrySubmission,
};
use telemetry_ingestor::publisher::Publisher;
use telemetry_ingestor::store::{MemoryDeviceStore, MemoryTelemetryStore, TelemetryStore};
use telemetry_ingestor::worker::{IngestWorker, WorkerConfig, WorkerState, WorkerStats};
use telemetry_ingestor::Error;

const TOPIC: &str = "telemetry";
const GROUP: &str = "iot-platform-group";

/// Fails the first `failures` writes, then delegates.
struct FlakyStore {
    inner: MemoryTelemetryStore,
    failures: AtomicU32,
}

impl FlakyStore {
    fn failing(failures: u32) -> Self {
        Self {
            inner: MemoryTelemetryStore::new(),
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl TelemetryStore for FlakyStore {
    async fn append(&self, message: &TelemetryMessage) -> telemetry_ingestor::Result<Uuid> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.append(message).await
    }

    async fn list_by_device(&self, device_id: Uuid) -> telemetry_ingestor::Result<Vec<TelemetryReading>> {
        self.inner.list_by_device(device_id).await
    }

    async fn page(
        &self,
        device_id: Uuid,
        request: PageRequest,
    ) -> telemetry_ingestor::Result<PagedResult<TelemetryReading>> {
        self.inner.page(device_id, request).await
    }

    async fn latest(&self, count: u32) -> telemetry_ingestor::Result<Vec<TelemetryReading>> {
        self.inner.latest(count).await
    }
}

struct Pipeline {
    broker: MemoryBroker,
    ingestion: Ingestion,
    clock: ManualClock,
    device_id: Uuid,
    cancel: CancellationToken,
}

impl Pipeline {
    fn new() -> Self {
        let broker = MemoryBroker::new(4);
        let clock = ManualClock::new(start_time());
        let devices = MemoryDeviceStore::new();
        let device_id = Uuid::new_v4();
        devices.insert(Device {
            id: device_id,
            name: "greenhouse-7".to_string(),
            device_type: "Sensor".to_string(),
            location: "north wing".to_string(),
        });
        let directory = DeviceDirectory::new(
            Arc::new(devices),
            Arc::new(MemoryCache::new(Arc::new(clock.clone()))),
            DEFAULT_TTL,
        );
        let publisher = Publisher::new(Arc::new(broker.producer(TOPIC)), Arc::new(clock.clone()));

        Self {
            ingestion: Ingestion::new(Arc::new(directory), publisher),
            broker,
            clock,
            device_id,
            cancel: CancellationToken::new(),
        }
    }

    fn worker(&self, name: &str, store: Arc<dyn TelemetryStore>) -> IngestWorker<MemoryConsumer> {
        IngestWorker::new(name, self.broker.consumer(TOPIC, GROUP), store, fast_config())
    }

    fn spawn(&self, name: &str, store: Arc<dyn TelemetryStore>) -> JoinHandle<WorkerStats> {
        tokio::spawn(self.worker(name, store).run(self.cancel.clone()))
    }

    async fn submit(&self, value: f64) {
        self.clock.advance(Duration::from_millis(10));
        self.ingestion
            .submit(&TelemetrySubmission {
                device_id: Some(self.device_id.to_string()),
                value: Some(value),
                metric_type: Some("temperature".to_string()),
            })
            .await
            .unwrap();
    }
}

fn start_time() -> DateTime<Utc> {
    "2024-05-01T12:00:00Z".parse().unwrap()
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        drain_timeout: Duration::from_secs(1),
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        revalidate: true,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_poison_payload_does_not_stop_ingestion() {
    let pipeline = Pipeline::new();
    let store = Arc::new(MemoryTelemetryStore::new());
    let worker = pipeline.worker("w1", store.clone());
    let state = worker.state();
    let handle = tokio::spawn(worker.run(pipeline.cancel.clone()));

    let producer = pipeline.broker.producer(TOPIC);
    producer
        .send(&pipeline.device_id.to_string(), b"\x00\x01 definitely not json".to_vec())
        .await
        .unwrap();
    for i in 0..9 {
        pipeline.submit(i as f64).await;
    }

    wait_until(|| pipeline.broker.lag(TOPIC, GROUP) == 0).await;
    assert_eq!(store.len(), 9);
    assert!(!handle.is_finished());
    assert_ne!(*state.borrow(), WorkerState::Stopped);

    pipeline.cancel.cancel();
    let stats = handle.await.unwrap();
    assert_eq!(stats.persisted, 9);
    assert_eq!(stats.skipped, 1);
}

#[tokio::test]
async fn test_failed_persist_is_retried_from_the_channel() {
    let pipeline = Pipeline::new();
    let store = Arc::new(FlakyStore::failing(2));
    let handle = pipeline.spawn("w1", store.clone());

    pipeline.submit(42.0).await;

    wait_until(|| store.inner.len() == 1).await;
    wait_until(|| pipeline.broker.lag(TOPIC, GROUP) == 0).await;
    pipeline.cancel.cancel();

    let stats = handle.await.unwrap();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.persisted, 1);
    let readings = store.inner.list_by_device(pipeline.device_id).await.unwrap();
    assert_eq!(readings[0].value, 42.0);
}

#[tokio::test]
async fn test_group_members_share_the_load_without_loss() {
    let pipeline = Pipeline::new();
    let store = Arc::new(MemoryTelemetryStore::new());
    let w1 = pipeline.worker("w1", store.clone());
    let w2 = pipeline.worker("w2", store.clone());
    let (mut s1, mut s2) = (w1.state(), w2.state());
    let first = tokio::spawn(w1.run(pipeline.cancel.clone()));
    let second = tokio::spawn(w2.run(pipeline.cancel.clone()));
    s1.wait_for(|s| *s == WorkerState::Polling).await.unwrap();
    s2.wait_for(|s| *s == WorkerState::Polling).await.unwrap();

    // Several devices so more than one partition is in use.
    let producer = pipeline.broker.producer(TOPIC);
    let total = 200;
    for i in 0..total {
        let device_id = Uuid::new_v4();
        let message = TelemetryMessage {
            device_id,
            value: (i % 100) as f64,
            metric_type: "humidity".to_string(),
            timestamp: Utc::now(),
        };
        producer
            .send(&device_id.to_string(), serde_json::to_vec(&message).unwrap())
            .await
            .unwrap();
    }

    wait_until(|| store.len() == total).await;
    pipeline.cancel.cancel();

    let a = first.await.unwrap();
    let b = second.await.unwrap();
    assert_eq!(a.persisted + b.persisted, total as u64);
    assert_eq!(pipeline.broker.lag(TOPIC, GROUP), 0);
}

#[tokio::test]
async fn test_readings_listed_newest_first() {
    let pipeline = Pipeline::new();
    let store = Arc::new(MemoryTelemetryStore::new());
    let handle = pipeline.spawn("w1", store.clone());

    for i in 0..25 {
        pipeline.submit(i as f64).await;
    }
    wait_until(|| store.len() == 25).await;
    pipeline.cancel.cancel();
    handle.await.unwrap();

    let readings = store.list_by_device(pipeline.device_id).await.unwrap();
    assert!(readings.windows(2).all(|w| w[0].timestamp > w[1].timestamp));
    assert_eq!(readings[0].value, 24.0);
    assert_eq!(readings[24].value, 0.0);
}

#[tokio::test]
async fn test_paging_through_ingested_readings() {
    let pipeline = Pipeline::new();
    let store = Arc::new(MemoryTelemetryStore::new());
    let handle = pipeline.spawn("w1", store.clone());

    for i in 0..45 {
        pipeline.submit((i % 50) as f64).await;
    }
    wait_until(|| store.len() == 45).await;
    pipeline.cancel.cancel();
    handle.await.unwrap();

    let first = store
        .page(pipeline.device_id, PageRequest::new(1, 20).unwrap())
        .await
        .unwrap();
    assert_eq!(first.items.len(), 20);
    assert_eq!(first.total_count, 45);

    let last = store
        .page(pipeline.device_id, PageRequest::new(3, 20).unwrap())
        .await
        .unwrap();
    assert_eq!(last.items.len(), 5);
    assert_eq!(last.total_count, 45);
    assert_eq!(last.items[4].value, 0.0);
}

#[tokio::test]
async fn test_unacked_work_survives_worker_crash() {
    let pipeline = Pipeline::new();
    pipeline.submit(7.5).await;

    // A consumer takes the message and dies before persisting it.
    let mut crashed = pipeline.broker.consumer(TOPIC, GROUP);
    crashed.subscribe().await.unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(1), crashed.poll())
        .await
        .unwrap()
        .unwrap();
    assert!(!delivery.payload.is_empty());
    drop(crashed);

    let store = Arc::new(MemoryTelemetryStore::new());
    let handle = pipeline.spawn("w2", store.clone());
    wait_until(|| store.len() == 1).await;

    pipeline.cancel.cancel();
    handle.await.unwrap();
    assert_eq!(store.list_by_device(pipeline.device_id).await.unwrap()[0].value, 7.5);
}

#[tokio::test]
async fn test_workers_stop_on_cancel() {
    let pipeline = Pipeline::new();
    let store = Arc::new(MemoryTelemetryStore::new());
    let handles: Vec<_> = (0..3)
        .map(|i| pipeline.spawn(&format!("w{i}"), store.clone()))
        .collect();

    pipeline.submit(1.0).await;
    wait_until(|| store.len() == 1).await;
    pipeline.cancel.cancel();

    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
