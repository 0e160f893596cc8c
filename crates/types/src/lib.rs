use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimension value written for measurements that have no sub-channel.
pub const SUB_CHANNEL_NONE: &str = "null";

/// Category label carried by every derived measurement.
pub const DERIVED_CATEGORY: &str = "derived";

/// Raw key/value payload returned by the vendor for one device.
pub type RawTelemetry = BTreeMap<String, serde_json::Value>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Canonical measure kinds. Unknown names round-trip through `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MeasureKind {
    Voltage,
    Current,
    Power,
    Temperature,
    Other(String),
}

impl MeasureKind {
    pub fn as_str(&self) -> &str {
        match self {
            MeasureKind::Voltage => "voltage",
            MeasureKind::Current => "current",
            MeasureKind::Power => "power",
            MeasureKind::Temperature => "temperature",
            MeasureKind::Other(name) => name,
        }
    }

    /// Decimal places kept for values of this kind.
    pub fn default_precision(&self) -> u32 {
        match self {
            MeasureKind::Temperature => 2,
            _ => 4,
        }
    }
}

impl From<String> for MeasureKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "voltage" => MeasureKind::Voltage,
            "current" => MeasureKind::Current,
            "power" => MeasureKind::Power,
            "temperature" => MeasureKind::Temperature,
            _ => MeasureKind::Other(value),
        }
    }
}

impl From<&str> for MeasureKind {
    fn from(value: &str) -> Self {
        MeasureKind::from(value.to_string())
    }
}

impl From<MeasureKind> for String {
    fn from(value: MeasureKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for MeasureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Largest number of decimal places a rule may round to.
pub const MAX_PRECISION: u32 = 15;

/// Rounds half away from zero to `precision` decimal places. `None` when the
/// precision is above [`MAX_PRECISION`] or the scaled value overflows.
pub fn round_to(value: f64, precision: u32) -> Option<f64> {
    if precision > MAX_PRECISION {
        return None;
    }
    let factor = 10f64.powi(precision as i32);
    let rounded = (value * factor).round() / factor;
    rounded.is_finite().then_some(rounded)
}

/// One device as reported by the inventory for the current cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Vendor id used to fetch telemetry.
    pub device_id: String,
    /// Vendor category, e.g. "Controller" or "Battery Shunt".
    pub category: String,
    pub display_name: String,
    pub sku: String,
}

impl DeviceDescriptor {
    /// Stable short identity: `<prefix>-<last three characters of the id>`.
    pub fn identity(&self, prefix: &str) -> String {
        let chars: Vec<char> = self.device_id.chars().collect();
        let start = chars.len().saturating_sub(3);
        let suffix: String = chars[start..].iter().collect();
        format!("{prefix}-{suffix}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub device_identity: String,
    pub category_label: String,
    pub display_name: String,
    pub sku: String,
    pub measure_kind: MeasureKind,
    pub sub_channel: Option<String>,
    pub value: f64,
}

impl Measurement {
    pub fn key(&self) -> MeasurementKey<'_> {
        MeasurementKey {
            device_identity: &self.device_identity,
            sub_channel: self.sub_channel.as_deref(),
            measure_kind: &self.measure_kind,
        }
    }

    /// Sub-channel as written to dimension columns.
    pub fn sub_channel_or_none(&self) -> &str {
        self.sub_channel.as_deref().unwrap_or(SUB_CHANNEL_NONE)
    }
}

/// Identity of a channel within one cycle; unique across a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeasurementKey<'a> {
    pub device_identity: &'a str,
    pub sub_channel: Option<&'a str>,
    pub measure_kind: &'a MeasureKind,
}

impl fmt::Display for MeasurementKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.device_identity,
            self.sub_channel.unwrap_or(SUB_CHANNEL_NONE),
            self.measure_kind
        )
    }
}

/// Every measurement produced by one cycle, stamped with the cycle time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementBatch {
    pub timestamp_ms: u64,
    pub measurements: Vec<Measurement>,
}

impl MeasurementBatch {
    pub fn new(timestamp_ms: u64, measurements: Vec<Measurement>) -> Self {
        Self {
            timestamp_ms,
            measurements,
        }
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}

/// A curated value forwarded to the metrics/alerting backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedMetric {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub dimensions: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("device enumeration failed: {0}")]
    Enumeration(#[source] BoxError),
    #[error("telemetry fetch failed for device {device_id}: {source}")]
    Fetch {
        device_id: String,
        #[source]
        source: BoxError,
    },
    #[error("time-series write of {points} points failed: {source}")]
    Write {
        points: usize,
        #[source]
        source: BoxError,
    },
    #[error("metrics publish of {metrics} metrics failed: {source}")]
    Publish {
        metrics: usize,
        #[source]
        source: BoxError,
    },
}

impl CollaboratorError {
    pub fn enumeration(err: impl Into<BoxError>) -> Self {
        CollaboratorError::Enumeration(err.into())
    }

    pub fn fetch(device_id: impl Into<String>, err: impl Into<BoxError>) -> Self {
        CollaboratorError::Fetch {
            device_id: device_id.into(),
            source: err.into(),
        }
    }

    pub fn write(points: usize, err: impl Into<BoxError>) -> Self {
        CollaboratorError::Write {
            points,
            source: err.into(),
        }
    }

    pub fn publish(metrics: usize, err: impl Into<BoxError>) -> Self {
        CollaboratorError::Publish {
            metrics,
            source: err.into(),
        }
    }
}

/// Lists the devices to poll this cycle.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, CollaboratorError>;
}

/// Fetches the latest raw telemetry of one device.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn fetch(&self, device_id: &str) -> Result<RawTelemetry, CollaboratorError>;
}

/// Accepts a whole cycle's measurements in one call.
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write_batch(&self, batch: &MeasurementBatch) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn publish(&self, metrics: &[NamedMetric]) -> Result<(), CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_uses_last_three_characters() {
        let device = DeviceDescriptor {
            device_id: "4721167408096062914".to_string(),
            category: "Controller".to_string(),
            display_name: "RNG-CTRL".to_string(),
            sku: "RNG-CTRL-RVR40".to_string(),
        };
        assert_eq!(device.identity("mppt"), "mppt-914");

        let short = DeviceDescriptor {
            device_id: "71".to_string(),
            ..device
        };
        assert_eq!(short.identity("shnt"), "shnt-71");
    }

    #[test]
    fn measure_kind_names_round_trip() {
        for name in ["voltage", "current", "power", "temperature", "humidity"] {
            let kind = MeasureKind::from(name);
            assert_eq!(kind.as_str(), name);
        }
        assert_eq!(MeasureKind::from("humidity"), MeasureKind::Other("humidity".to_string()));
    }

    #[test]
    fn rounding_keeps_declared_precision() {
        assert_eq!(round_to(12345.0 / 1000.0, 4), Some(12.345));
        assert_eq!(round_to(1.23456789, 4), Some(1.2346));
        assert_eq!(round_to(98.765, 2), Some(98.77));
    }

    #[test]
    fn rounding_rejects_overflow_and_excess_precision() {
        assert_eq!(round_to(1e305, 4), None);
        assert_eq!(round_to(13.0, 400), None);
        assert_eq!(round_to(13.0, MAX_PRECISION), Some(13.0));
    }
}
