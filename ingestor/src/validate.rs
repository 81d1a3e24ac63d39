use std::collections::BTreeMap;
use std::fmt;

use serde::ser::{Serialize, SerializeMap, Serializer};
use uuid::Uuid;

use crate::model::{TelemetryMessage, TelemetrySubmission};

pub const VALUE_MIN: f64 = -100.0;
pub const VALUE_MAX: f64 = 100.0;
pub const METRIC_TYPE_MAX_LEN: usize = 50;

/// Field names as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Field {
    DeviceId,
    Value,
    MetricType,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::DeviceId => "DeviceId",
            Field::Value => "Value",
            Field::MetricType => "MetricType",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub field: Field,
    pub message: String,
}

/// All violations found for one candidate reading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationErrors {
    violations: Vec<Violation>,
}

impl ValidationErrors {
    fn push(&mut self, field: Field, message: impl Into<String>) {
        self.violations.push(Violation {
            field,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn has_field(&self, field: Field) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }

    /// Messages grouped by field name.
    pub fn to_map(&self) -> BTreeMap<&'static str, Vec<String>> {
        let mut map: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
        for violation in &self.violations {
            map.entry(violation.field.as_str())
                .or_default()
                .push(violation.message.clone());
        }
        map
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .violations
            .iter()
            .map(|v| format!("{}: {}", v.field.as_str(), v.message))
            .collect();
        write!(f, "{}", rendered.join("; "))
    }
}

impl Serialize for ValidationErrors {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let grouped = self.to_map();
        let mut map = serializer.serialize_map(Some(grouped.len()))?;
        for (field, messages) in &grouped {
            map.serialize_entry(field, messages)?;
        }
        map.end()
    }
}

/// A submission that passed validation. Only `validate` constructs it.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidSubmission {
    device_id: Uuid,
    value: f64,
    metric_type: String,
}

impl ValidSubmission {
    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn metric_type(&self) -> &str {
        &self.metric_type
    }
}

/// Validates an HTTP submission, collecting every violation.
pub fn validate(submission: &TelemetrySubmission) -> Result<ValidSubmission, ValidationErrors> {
    let mut errors = ValidationErrors::default();

    let device_id = match submission.device_id.as_deref().map(str::trim) {
        None | Some("") => {
            errors.push(Field::DeviceId, "DeviceId is required");
            None
        }
        Some(raw) => match Uuid::parse_str(raw) {
            Ok(id) if id.is_nil() => {
                errors.push(Field::DeviceId, "DeviceId must not be empty");
                None
            }
            Ok(id) => Some(id),
            Err(_) => {
                errors.push(Field::DeviceId, "DeviceId must be a valid UUID");
                None
            }
        },
    };

    let value = match submission.value {
        None => {
            errors.push(Field::Value, "Value is required");
            None
        }
        Some(value) => {
            check_value(value, &mut errors);
            Some(value)
        }
    };

    let metric_type = match submission.metric_type.as_deref() {
        None => {
            errors.push(Field::MetricType, "MetricType is required");
            None
        }
        Some(metric_type) => {
            let metric_type = metric_type.trim();
            check_metric_type(metric_type, &mut errors);
            Some(metric_type.to_string())
        }
    };

    match (device_id, value, metric_type) {
        (Some(device_id), Some(value), Some(metric_type)) if errors.is_empty() => {
            Ok(ValidSubmission {
                device_id,
                value,
                metric_type,
            })
        }
        _ => Err(errors),
    }
}

/// Re-checks a decoded channel message against the same bounds.
pub fn validate_message(message: &TelemetryMessage) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();

    if message.device_id.is_nil() {
        errors.push(Field::DeviceId, "DeviceId must not be empty");
    }
    check_value(message.value, &mut errors);
    check_metric_type(&message.metric_type, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_value(value: f64, errors: &mut ValidationErrors) {
    // NaN fails the range check as well
    if !(VALUE_MIN..=VALUE_MAX).contains(&value) {
        errors.push(
            Field::Value,
            format!("Value {} out of range [{}, {}]", value, VALUE_MIN, VALUE_MAX),
        );
    }
}

/// Checks `metric_type` exactly as it will be stored.
fn check_metric_type(metric_type: &str, errors: &mut ValidationErrors) {
    if metric_type.trim().is_empty() {
        errors.push(Field::MetricType, "MetricType must not be empty");
    } else if metric_type.chars().count() > METRIC_TYPE_MAX_LEN {
        errors.push(
            Field::MetricType,
            format!("MetricType must be at most {} characters", METRIC_TYPE_MAX_LEN),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn submission(value: f64) -> TelemetrySubmission {
        TelemetrySubmission {
            device_id: Some(Uuid::new_v4().to_string()),
            value: Some(value),
            metric_type: Some("temperature".to_string()),
        }
    }

    #[test]
    fn test_valid_submission() {
        let input = submission(25.0);
        let valid = validate(&input).unwrap();
        assert_eq!(valid.value(), 25.0);
        assert_eq!(valid.metric_type(), "temperature");
        assert_eq!(valid.device_id().to_string(), input.device_id.unwrap());
    }

    #[test]
    fn test_bounds_are_inclusive() {
        assert!(validate(&submission(VALUE_MIN)).is_ok());
        assert!(validate(&submission(VALUE_MAX)).is_ok());
    }

    #[test]
    fn test_out_of_range_value_tags_value_field() {
        for value in [100.01, -100.5, 999.0, f64::NAN, f64::INFINITY] {
            let errors = validate(&submission(value)).unwrap_err();
            assert!(errors.has_field(Field::Value), "value {value} accepted");
            assert!(!errors.has_field(Field::DeviceId));
        }
    }

    #[test]
    fn test_missing_device_id() {
        let mut input = submission(10.0);
        input.device_id = None;
        let errors = validate(&input).unwrap_err();
        assert!(errors.has_field(Field::DeviceId));

        input.device_id = Some(Uuid::nil().to_string());
        assert!(validate(&input).unwrap_err().has_field(Field::DeviceId));

        input.device_id = Some("not-a-uuid".to_string());
        assert!(validate(&input).unwrap_err().has_field(Field::DeviceId));
    }

    #[test]
    fn test_metric_type_length() {
        let mut input = submission(10.0);
        input.metric_type = Some("x".repeat(METRIC_TYPE_MAX_LEN));
        assert!(validate(&input).is_ok());

        input.metric_type = Some("x".repeat(METRIC_TYPE_MAX_LEN + 1));
        assert!(validate(&input).unwrap_err().has_field(Field::MetricType));

        input.metric_type = Some("   ".to_string());
        assert!(validate(&input).unwrap_err().has_field(Field::MetricType));
    }

    #[test]
    fn test_collects_all_violations() {
        let errors = validate(&TelemetrySubmission::default()).unwrap_err();
        let map = errors.to_map();
        assert_eq!(map.len(), 3);
        assert!(map.contains_key("DeviceId"));
        assert!(map.contains_key("Value"));
        assert!(map.contains_key("MetricType"));

        let json = serde_json::to_value(&errors).unwrap();
        assert!(json["Value"].is_array());
    }

    #[test]
    fn test_validate_message_rechecks_bounds() {
        let mut message = TelemetryMessage {
            device_id: Uuid::new_v4(),
            value: 12.0,
            metric_type: "humidity".to_string(),
            timestamp: Utc::now(),
        };
        assert!(validate_message(&message).is_ok());

        message.value = 150.0;
        assert!(validate_message(&message).unwrap_err().has_field(Field::Value));
    }

    #[test]
    fn test_validate_message_measures_padded_metric_type() {
        let padded = format!("     {}", "x".repeat(METRIC_TYPE_MAX_LEN));
        let message = TelemetryMessage {
            device_id: Uuid::new_v4(),
            value: 1.0,
            metric_type: padded.clone(),
            timestamp: Utc::now(),
        };
        assert!(validate_message(&message)
            .unwrap_err()
            .has_field(Field::MetricType));

        // Submissions are trimmed before they are stored, so padding is harmless there.
        let mut input = submission(1.0);
        input.metric_type = Some(padded);
        assert_eq!(validate(&input).unwrap().metric_type().len(), METRIC_TYPE_MAX_LEN);
    }
}
