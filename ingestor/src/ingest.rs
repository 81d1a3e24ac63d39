use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::DeviceDirectory;
use crate::errors::{Error, Result};
use crate::metrics::{SUBMISSIONS_ACCEPTED_TOTAL, SUBMISSIONS_REJECTED_TOTAL};
use crate::model::{TelemetryMessage, TelemetrySubmission};
use crate::publisher::Publisher;
use crate::validate::validate;

/// Request-path entry point: validate, check the device, enqueue.
pub struct Ingestion {
    devices: Arc<DeviceDirectory>,
    publisher: Publisher,
}

impl Ingestion {
    pub fn new(devices: Arc<DeviceDirectory>, publisher: Publisher) -> Self {
        Self { devices, publisher }
    }

    pub async fn submit(&self, submission: &TelemetrySubmission) -> Result<TelemetryMessage> {
        let valid = match validate(submission) {
            Ok(valid) => valid,
            Err(errors) => {
                SUBMISSIONS_REJECTED_TOTAL.inc();
                debug!("Rejected submission: {}", errors);
                return Err(Error::Validation(errors));
            }
        };

        // Advisory only: the device may still disappear before the worker
        // persists the reading.
        if !self.devices.exists(valid.device_id()).await? {
            SUBMISSIONS_REJECTED_TOTAL.inc();
            info!(device_id = %valid.device_id(), "Rejected submission for unknown device");
            return Err(Error::DeviceNotFound(valid.device_id()));
        }

        let message = self.publisher.publish(valid).await?;
        SUBMISSIONS_ACCEPTED_TOTAL.inc();
        Ok(message)
    }
}
