use thiserror::Error;
use uuid::Uuid;

use crate::validate::ValidationErrors;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(ValidationErrors),

    #[error("Invalid page request: page={page}, page_size={page_size}")]
    InvalidPage { page: i64, page_size: i64 },

    #[error("Device {0} not found")]
    DeviceNotFound(Uuid),

    #[error("Message channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Message channel closed")]
    ChannelClosed,

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ValidationErrors> for Error {
    fn from(errors: ValidationErrors) -> Self {
        Error::Validation(errors)
    }
}

impl Error {
    /// Failures of the message channel itself, as opposed to the request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Mqtt(_) | Error::ChannelUnavailable(_) | Error::ChannelClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
