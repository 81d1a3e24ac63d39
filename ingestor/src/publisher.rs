use std::sync::Arc;

use tracing::{debug, error};

use crate::channel::ChannelProducer;
use crate::clock::Clock;
use crate::errors::Result;
use crate::metrics::PUBLISH_FAILURES_TOTAL;
use crate::model::TelemetryMessage;
use crate::validate::ValidSubmission;

/// Stamps validated submissions and hands them to the message channel.
#[derive(Clone)]
pub struct Publisher {
    producer: Arc<dyn ChannelProducer>,
    clock: Arc<dyn Clock>,
}

impl Publisher {
    pub fn new(producer: Arc<dyn ChannelProducer>, clock: Arc<dyn Clock>) -> Self {
        Self { producer, clock }
    }

    /// Returns the enqueued message once the channel accepted it. The reading
    /// is not durable yet.
    pub async fn publish(&self, submission: ValidSubmission) -> Result<TelemetryMessage> {
        let message = TelemetryMessage {
            device_id: submission.device_id(),
            value: submission.value(),
            metric_type: submission.metric_type().to_string(),
            timestamp: self.clock.now(),
        };
        let payload = serde_json::to_vec(&message)?;
        let key = message.device_id.to_string();

        if let Err(e) = self.producer.send(&key, payload).await {
            PUBLISH_FAILURES_TOTAL.inc();
            error!(device_id = %key, "Failed to publish telemetry: {}", e);
            return Err(e);
        }

        debug!(device_id = %key, metric_type = %message.metric_type, "Telemetry enqueued");
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryBroker;
    use crate::channel::ChannelConsumer;
    use crate::clock::ManualClock;
    use crate::errors::Error;
    use crate::model::TelemetrySubmission;
    use crate::validate::validate;
    use async_trait::async_trait;
    use uuid::Uuid;

    struct DownProducer;

    #[async_trait]
    impl ChannelProducer for DownProducer {
        async fn send(&self, _key: &str, _payload: Vec<u8>) -> Result<()> {
            Err(Error::ChannelUnavailable("broker unreachable".to_string()))
        }
    }

    fn valid(device_id: Uuid) -> ValidSubmission {
        validate(&TelemetrySubmission {
            device_id: Some(device_id.to_string()),
            value: Some(42.5),
            metric_type: Some("temperature".to_string()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_publish_writes_wire_message_keyed_by_device() {
        let broker = MemoryBroker::new(4);
        let clock = ManualClock::new("2024-03-01T08:30:00Z".parse().unwrap());
        let publisher = Publisher::new(Arc::new(broker.producer("telemetry")), Arc::new(clock));
        let mut consumer = broker.consumer("telemetry", "group");
        consumer.subscribe().await.unwrap();

        let device_id = Uuid::new_v4();
        let message = publisher.publish(valid(device_id)).await.unwrap();
        assert_eq!(message.timestamp.to_rfc3339(), "2024-03-01T08:30:00+00:00");

        let delivery = consumer.poll().await.unwrap();
        assert_eq!(delivery.key, device_id.to_string());
        let decoded: serde_json::Value = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(decoded["DeviceId"], device_id.to_string());
        assert_eq!(decoded["Value"], 42.5);
        assert_eq!(decoded["MetricType"], "temperature");
        assert_eq!(decoded["Timestamp"], "2024-03-01T08:30:00Z");
    }

    #[tokio::test]
    async fn test_channel_failure_is_surfaced() {
        let publisher = Publisher::new(Arc::new(DownProducer), Arc::new(ManualClock::default()));
        let err = publisher.publish(valid(Uuid::new_v4())).await.unwrap_err();
        assert!(err.is_transport());
    }
}
