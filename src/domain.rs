//! ==============================================================================
//! domain.rs - shared data model
//! ==============================================================================
//!
//! purpose:
//!     the values that flow between the drivers, the repository client and the
//!     two polling loops: sensor samples, repository entries and commands.
//!
//! relationships:
//!     - produced by: hal.rs / gpio.rs (RawReading), repository.rs (RepositoryEntry)
//!     - consumed by: publisher.rs (SensorSample), poller.rs (Action, decode_command)
//!
//! ==============================================================================

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// one raw read from the sensor driver; the dht library reports `None` on a bad frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

impl RawReading {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            temperature: Some(temperature),
            humidity: Some(humidity),
        }
    }

    /// a sample is only produced when both values are present
    pub fn validate(self) -> Option<SensorSample> {
        match (self.temperature, self.humidity) {
            (Some(temperature), Some(humidity)) if temperature.is_finite() && humidity.is_finite() => {
                Some(SensorSample {
                    temperature,
                    humidity,
                    captured_at_ms: timestamp_ms(),
                })
            }
            _ => None,
        }
    }
}

/// a validated temperature/humidity sample, serialized as the entry content
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorSample {
    #[serde(rename = "temp")]
    pub temperature: f64,
    #[serde(rename = "hum")]
    pub humidity: f64,
    #[serde(skip)]
    pub captured_at_ms: u64,
}

/// one content instance as read back from the repository
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryEntry {
    /// `ri`: assigned by the repository, the only field used for duplicate detection
    pub resource_id: Option<String>,
    /// `con`: usually a json string, sometimes already a mapping
    pub content: Option<Value>,
}

/// `<applicationEntity>/<container>` under the repository base url
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPath {
    pub application_entity: String,
    pub container: String,
}

impl ContainerPath {
    pub fn new(application_entity: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            application_entity: application_entity.into(),
            container: container.into(),
        }
    }

    pub fn url(&self, base_url: &str) -> String {
        format!(
            "{}/{}/{}",
            base_url.trim_end_matches('/'),
            self.application_entity,
            self.container
        )
    }

    pub fn latest_url(&self, base_url: &str) -> String {
        format!("{}/la", self.url(base_url))
    }
}

impl std::fmt::Display for ContainerPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.application_entity, self.container)
    }
}

/// binary actuator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    On,
    #[default]
    Off,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::On => f.write_str("ON"),
            Action::Off => f.write_str("OFF"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("content is not valid json ({source}): {raw}")]
    Parse {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("content is not a mapping: {0}")]
    NotMapping(Value),

    #[error("unrecognized {field} value: {value}")]
    Unrecognized { field: String, value: Value },
}

/// map one raw action value onto ON/OFF
///
/// accepted encodings: "on" / "1" / true / 1 and "off" / "0" / false / 0.
/// strings are matched exactly; numbers by value, so 1.0 is ON.
pub fn decode_action(raw: &Value) -> Option<Action> {
    match raw {
        Value::String(s) => match s.as_str() {
            "on" | "1" => Some(Action::On),
            "off" | "0" => Some(Action::Off),
            _ => None,
        },
        Value::Bool(true) => Some(Action::On),
        Value::Bool(false) => Some(Action::Off),
        Value::Number(n) => match n.as_f64() {
            Some(v) if v == 1.0 => Some(Action::On),
            Some(v) if v == 0.0 => Some(Action::Off),
            _ => None,
        },
        _ => None,
    }
}

/// turn an entry's `con` into a command
///
/// a string is parsed as json first; the result must be a mapping holding
/// a recognized value under `field`.
pub fn decode_command(content: &Value, field: &str) -> Result<Action, PayloadError> {
    let parsed;
    let content = match content {
        Value::String(raw) => {
            parsed = serde_json::from_str::<Value>(raw).map_err(|source| PayloadError::Parse {
                raw: raw.clone(),
                source,
            })?;
            &parsed
        }
        other => other,
    };

    let mapping: &Map<String, Value> = content
        .as_object()
        .ok_or_else(|| PayloadError::NotMapping(content.clone()))?;

    let value = mapping.get(field).unwrap_or(&Value::Null);
    decode_action(value).ok_or_else(|| PayloadError::Unrecognized {
        field: field.to_string(),
        value: value.clone(),
    })
}

/// current unix time in milliseconds
pub fn timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
