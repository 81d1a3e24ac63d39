//! Storage traits and the in-memory backends.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::errors::Result;
use crate::model::{Device, PageRequest, PagedResult, TelemetryMessage, TelemetryReading};

/// Append-only telemetry history.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Persists one reading and returns its newly assigned id.
    async fn append(&self, message: &TelemetryMessage) -> Result<Uuid>;

    /// Every reading of a device, newest first.
    async fn list_by_device(&self, device_id: Uuid) -> Result<Vec<TelemetryReading>>;

    /// One page of a device's readings, newest first. `total_count` and
    /// `items` come from the same snapshot.
    async fn page(
        &self,
        device_id: Uuid,
        request: PageRequest,
    ) -> Result<PagedResult<TelemetryReading>>;

    /// The `count` most recent readings across all devices.
    async fn latest(&self, count: u32) -> Result<Vec<TelemetryReading>>;
}

/// Read-only view of the device registry.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn find(&self, id: Uuid) -> Result<Option<Device>>;
}

/// Newest first; id breaks timestamp ties so paging is stable.
pub(crate) fn newest_first(a: &TelemetryReading, b: &TelemetryReading) -> Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| b.id.cmp(&a.id))
}

#[derive(Default)]
pub struct MemoryTelemetryStore {
    readings: RwLock<Vec<TelemetryReading>>,
}

impl MemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.readings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn device_snapshot(&self, device_id: Uuid) -> Vec<TelemetryReading> {
        let mut rows: Vec<TelemetryReading> = self
            .readings
            .read()
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect();
        rows.sort_by(newest_first);
        rows
    }
}

#[async_trait]
impl TelemetryStore for MemoryTelemetryStore {
    async fn append(&self, message: &TelemetryMessage) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.readings.write().push(message.clone().into_reading(id));
        Ok(id)
    }

    async fn list_by_device(&self, device_id: Uuid) -> Result<Vec<TelemetryReading>> {
        Ok(self.device_snapshot(device_id))
    }

    async fn page(
        &self,
        device_id: Uuid,
        request: PageRequest,
    ) -> Result<PagedResult<TelemetryReading>> {
        Ok(PagedResult::from_snapshot(
            request,
            self.device_snapshot(device_id),
        ))
    }

    async fn latest(&self, count: u32) -> Result<Vec<TelemetryReading>> {
        let mut rows = self.readings.read().clone();
        rows.sort_by(newest_first);
        rows.truncate(count as usize);
        Ok(rows)
    }
}

#[derive(Default)]
pub struct MemoryDeviceStore {
    devices: RwLock<HashMap<Uuid, Device>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: Device) {
        self.devices.write().insert(device.id, device);
    }

    pub fn remove(&self, id: Uuid) -> Option<Device> {
        self.devices.write().remove(&id)
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn find(&self, id: Uuid) -> Result<Option<Device>> {
        Ok(self.devices.read().get(&id).cloned())
    }
}
