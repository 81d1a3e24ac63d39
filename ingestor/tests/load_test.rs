use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use telemetry_ingestor::channel::memory::MemoryBroker;
use telemetry_ingestor::channel::mqtt::{MqttProducer, MqttSettings};
use telemetry_ingestor::channel::ChannelProducer;
use telemetry_ingestor::clock::SystemClock;
use telemetry_ingestor::model::TelemetrySubmission;
use telemetry_ingestor::publisher::Publisher;
use telemetry_ingestor::store::MemoryTelemetryStore;
use telemetry_ingestor::validate::validate;
use telemetry_ingestor::worker::{IngestWorker, WorkerConfig};

fn random_submission(device_id: Uuid) -> TelemetrySubmission {
    let mut rng = rand::thread_rng();
    TelemetrySubmission {
        device_id: Some(device_id.to_string()),
        value: Some(rng.gen_range(15.0..35.0)),
        metric_type: Some("temperature".to_string()),
    }
}

#[tokio::test]
async fn test_in_process_pipeline_drains_burst() {
    let total = 5_000;
    let broker = MemoryBroker::default();
    let store = Arc::new(MemoryTelemetryStore::new());
    let cancel = CancellationToken::new();

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let worker = IngestWorker::new(
                format!("load-{i}"),
                broker.consumer("telemetry", "load"),
                store.clone(),
                WorkerConfig::default(),
            );
            tokio::spawn(worker.run(cancel.clone()))
        })
        .collect();

    let publisher = Publisher::new(Arc::new(broker.producer("telemetry")), Arc::new(SystemClock));
    let devices: Vec<Uuid> = (0..50).map(|_| Uuid::new_v4()).collect();

    let start = Instant::now();
    for i in 0..total {
        let submission = random_submission(devices[i % devices.len()]);
        publisher.publish(validate(&submission).unwrap()).await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(30), async {
        while store.len() < total {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pipeline did not drain in time");
    let duration = start.elapsed();

    cancel.cancel();
    let mut persisted = 0;
    for worker in workers {
        persisted += worker.await.unwrap().persisted;
    }

    println!(
        "Persisted {} readings in {:.2}s ({:.0} msg/s)",
        persisted,
        duration.as_secs_f64(),
        persisted as f64 / duration.as_secs_f64()
    );
    assert_eq!(persisted, total as u64);
    assert_eq!(broker.lag("telemetry", "load"), 0);
}

/// Needs a broker on localhost:1883 and a running ingestor.
#[tokio::test]
#[ignore]
async fn test_1000_messages_per_second() {
    println!("\nStarting load test: 1000 msg/s");

    let test_duration_secs = 10;
    let target_rate = 1000;
    let total_messages = test_duration_secs * target_rate;

    let settings = MqttSettings {
        broker: "localhost".to_string(),
        port: 1883,
        client_id: format!("load-test-{}", Uuid::new_v4()),
        topic: "telemetry".to_string(),
        keep_alive: Duration::from_secs(30),
    };
    let producer = Arc::new(MqttProducer::connect(&settings, Duration::from_secs(5)));

    let deadline = Instant::now() + Duration::from_secs(5);
    while !producer.is_connected() {
        assert!(Instant::now() < deadline, "could not connect to MQTT broker");
        sleep(Duration::from_millis(50)).await;
    }

    let publisher = Publisher::new(producer.clone() as Arc<dyn ChannelProducer>, Arc::new(SystemClock));
    let devices: Vec<Uuid> = (0..10).map(|_| Uuid::new_v4()).collect();

    let start = Instant::now();
    let mut sent_count = 0;
    let mut error_count = 0;

    let burst_size = 100;
    let delay_per_burst = Duration::from_micros((burst_size * 1_000_000) / target_rate as u64);

    for batch_start in (0..total_messages).step_by(burst_size as usize) {
        for i in batch_start..std::cmp::min(batch_start + burst_size as usize, total_messages) {
            let submission = random_submission(devices[i % devices.len()]);
            match publisher.publish(validate(&submission).unwrap()).await {
                Ok(_) => sent_count += 1,
                Err(e) => {
                    error_count += 1;
                    if error_count < 10 {
                        eprintln!("Send error: {}", e);
                    }
                }
            }
        }
        sleep(delay_per_burst).await;
    }

    let duration = start.elapsed();
    let actual_rate = sent_count as f64 / duration.as_secs_f64();

    println!("  Total sent:  {}", sent_count);
    println!("  Errors:      {}", error_count);
    println!("  Duration:    {:.2}s", duration.as_secs_f64());
    println!("  Actual rate: {:.2} msg/s", actual_rate);

    assert!(
        actual_rate >= 900.0,
        "Throughput too low: {:.2} msg/s (expected >= 900)",
        actual_rate
    );
    assert_eq!(error_count, 0, "Too many errors: {}", error_count);
}
