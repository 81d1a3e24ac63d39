use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use clap::Parser;
use rand::Rng;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use telemetry_ingestor::channel::mqtt::{MqttProducer, MqttSettings};
use telemetry_ingestor::clock::SystemClock;
use telemetry_ingestor::model::TelemetrySubmission;
use telemetry_ingestor::publisher::Publisher;
use telemetry_ingestor::validate::validate;

const BURST_SIZE: u64 = 200;
const METRIC_TYPES: [&str; 3] = ["temperature", "humidity", "battery"];
/// High bits of generated device ids; the low bits carry the device index.
const DEVICE_NAMESPACE: u128 = 0x5e4d_0000_0000_4000_8000_0000_0000_0000;

#[derive(Parser, Debug, Clone)]
#[command(name = "simulator", version, about = "Publishes synthetic device telemetry")]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,
    #[arg(long, env = "TELEMETRY_TOPIC", default_value = "telemetry")]
    topic: String,
    /// Messages per second.
    #[arg(long, env = "RATE", default_value_t = 1000)]
    rate: u64,
    #[arg(long, env = "DEVICES", default_value_t = 100)]
    devices: u32,
    /// Share of readings generated outside the accepted value range.
    #[arg(long, env = "OUTLIER_RATIO", default_value_t = 0.05)]
    outlier_ratio: f64,
    /// Stop after this many messages; runs until interrupted when absent.
    #[arg(long, env = "LIMIT")]
    limit: Option<u64>,
}

/// Stable id for the n-th simulated device, so repeated runs hit the same rows.
fn device_id(index: u32) -> Uuid {
    Uuid::from_u128(DEVICE_NAMESPACE | index as u128)
}

fn generate_submission(rng: &mut impl Rng, device_id: Uuid, outlier_ratio: f64) -> TelemetrySubmission {
    let metric_type = METRIC_TYPES[rng.gen_range(0..METRIC_TYPES.len())];
    let value = if rng.gen_bool(outlier_ratio) {
        let magnitude = rng.gen_range(100.5..500.0);
        if rng.gen_bool(0.5) {
            magnitude
        } else {
            -magnitude
        }
    } else {
        match metric_type {
            "temperature" => rng.gen_range(15.0..35.0),
            "humidity" => rng.gen_range(30.0..80.0),
            _ => rng.gen_range(20.0..100.0),
        }
    };

    TelemetrySubmission {
        device_id: Some(device_id.to_string()),
        value: Some(value),
        metric_type: Some(metric_type.to_string()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.rate == 0 || args.devices == 0 {
        bail!("--rate and --devices must be greater than 0");
    }
    if !(0.0..=1.0).contains(&args.outlier_ratio) {
        bail!("--outlier-ratio must be within 0..=1");
    }

    info!("Starting IoT Simulator");
    info!(
        "Broker: {}:{}, Rate: {} msg/s, Devices: {}",
        args.broker, args.port, args.rate, args.devices
    );

    let settings = MqttSettings {
        broker: args.broker.clone(),
        port: args.port,
        client_id: format!("sim-{}", rand::thread_rng().gen::<u32>()),
        topic: args.topic.clone(),
        keep_alive: Duration::from_secs(30),
    };
    let producer = Arc::new(MqttProducer::connect(&settings, Duration::from_secs(5)));
    while !producer.is_connected() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("Connected to MQTT broker, starting to publish telemetry");

    let publisher = Publisher::new(producer, Arc::new(SystemClock));
    let devices: Vec<Uuid> = (0..args.devices).map(device_id).collect();

    let burst_interval = Duration::from_millis((BURST_SIZE * 1000) / args.rate);
    info!("Publishing in bursts of {} messages every {:?}", BURST_SIZE, burst_interval);

    let mut rng = rand::thread_rng();
    let mut published = 0u64;
    let mut rejected = 0u64;
    let mut failed = 0u64;
    let mut attempted = 0u64;

    loop {
        let burst_start = Instant::now();

        for _ in 0..BURST_SIZE {
            if args.limit.is_some_and(|limit| attempted >= limit) {
                info!(
                    "Done: {} published, {} rejected by validation, {} failed",
                    published, rejected, failed
                );
                return Ok(());
            }
            let device = devices[(attempted % devices.len() as u64) as usize];
            attempted += 1;

            let submission = generate_submission(&mut rng, device, args.outlier_ratio);
            let valid = match validate(&submission) {
                Ok(valid) => valid,
                Err(errors) => {
                    rejected += 1;
                    debug!(device_id = %device, "Dropping invalid reading: {}", errors);
                    continue;
                }
            };

            match publisher.publish(valid).await {
                Ok(_) => published += 1,
                Err(e) => {
                    failed += 1;
                    warn!("Failed to publish: {}", e);
                }
            }
        }

        if attempted % 10_000 == 0 {
            info!(
                "Published {} messages ({} rejected, {} failed)",
                published, rejected, failed
            );
        }

        let elapsed = burst_start.elapsed();
        if elapsed < burst_interval {
            tokio::time::sleep(burst_interval - elapsed).await;
        } else if elapsed > burst_interval * 2 {
            warn!(
                "Burst took {:?}, target was {:?} - system may be overloaded",
                elapsed, burst_interval
            );
        }
    }
}
