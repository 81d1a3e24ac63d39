use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Error, Result};

/// Persisted telemetry reading. `id` is assigned by the store on append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReading {
    pub id: Uuid,
    pub device_id: Uuid,
    pub value: f64,
    pub metric_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Channel payload produced by the publisher and consumed by the ingest worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TelemetryMessage {
    pub device_id: Uuid,
    pub value: f64,
    pub metric_type: String,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryMessage {
    pub fn into_reading(self, id: Uuid) -> TelemetryReading {
        TelemetryReading {
            id,
            device_id: self.device_id,
            value: self.value,
            metric_type: self.metric_type,
            timestamp: self.timestamp,
        }
    }
}

/// Raw submission as it arrives on the HTTP ingestion endpoint.
///
/// Every field is optional so that a structurally valid JSON object always
/// reaches the validator, which reports missing fields as violations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySubmission {
    #[serde(default, alias = "DeviceId")]
    pub device_id: Option<String>,
    #[serde(default, alias = "Value")]
    pub value: Option<f64>,
    #[serde(default, alias = "MetricType")]
    pub metric_type: Option<String>,
}

/// Registered device. Owned by the device registry, read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    pub device_type: String,
    pub location: String,
}

/// Validated 1-based page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: u32,
    page_size: u32,
}

impl PageRequest {
    pub fn new(page: i64, page_size: i64) -> Result<Self> {
        if page < 1 || page_size < 1 {
            return Err(Error::InvalidPage { page, page_size });
        }
        let page = u32::try_from(page).map_err(|_| Error::InvalidPage { page, page_size })?;
        let page_size =
            u32::try_from(page_size).map_err(|_| Error::InvalidPage { page: page as i64, page_size })?;
        Ok(Self { page, page_size })
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Number of rows to skip.
    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.page_size as u64
    }
}

/// One page of a time-ordered query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResult<T> {
    pub page: u32,
    pub page_size: u32,
    pub total_count: u64,
    #[serde(rename = "data")]
    pub items: Vec<T>,
}

impl<T> PagedResult<T> {
    /// Slices an already ordered snapshot according to `request`.
    pub fn from_snapshot(request: PageRequest, ordered: Vec<T>) -> Self {
        let total_count = ordered.len() as u64;
        let items = ordered
            .into_iter()
            .skip(usize::try_from(request.offset()).unwrap_or(usize::MAX))
            .take(request.page_size() as usize)
            .collect();
        Self {
            page: request.page(),
            page_size: request.page_size(),
            total_count,
            items,
        }
    }
}
