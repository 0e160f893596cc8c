use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use derivation::{derive, DerivationError, DerivationRule, Lookup, MeasurementIndex};
use field_map::FieldTable;
use normalizer::normalize_device;
use types::{
    CollaboratorError, DeviceDescriptor, DeviceSource, MeasureKind, Measurement, MeasurementBatch,
    MetricsSink, NamedMetric, TelemetrySource, TimeSeriesSink,
};

#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub poll_interval: Duration,
    pub jitter_ms: u64,
    /// Cycle timestamps are truncated to a multiple of this many milliseconds.
    pub timestamp_granularity_ms: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            jitter_ms: 0,
            timestamp_granularity_ms: 60_000,
        }
    }
}

/// One measurement forwarded to the metrics backend under a fixed name.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSelection {
    pub name: String,
    pub unit: String,
    pub lookup: Lookup,
    #[cfg_attr(feature = "config", serde(default))]
    pub dimensions: Vec<(String, String)>,
}

impl MetricSelection {
    /// Bus voltage reported by the reference shunt.
    pub fn main_voltage(reference: &str) -> Self {
        Self {
            name: "MainVoltage".to_string(),
            unit: "None".to_string(),
            lookup: Lookup::new(reference, Some("primary"), MeasureKind::Voltage),
            dimensions: vec![("Device".to_string(), "Main".to_string())],
        }
    }
}

/// Everything that turns raw telemetry into a batch; fixed for the process
/// lifetime.
#[derive(Debug, Clone)]
pub struct Pipeline {
    table: FieldTable,
    derivations: Vec<DerivationRule>,
    selections: Vec<MetricSelection>,
}

impl Pipeline {
    pub fn new(
        table: FieldTable,
        derivations: Vec<DerivationRule>,
        selections: Vec<MetricSelection>,
    ) -> Result<Self, DerivationError> {
        for rule in &derivations {
            rule.validate()?;
        }
        Ok(Self {
            table,
            derivations,
            selections,
        })
    }

    pub fn table(&self) -> &FieldTable {
        &self.table
    }

    /// Picks the curated metrics out of a finished batch.
    pub fn select_metrics(&self, measurements: &[Measurement]) -> Vec<NamedMetric> {
        let index = MeasurementIndex::new(measurements);
        self.selections
            .iter()
            .filter_map(|selection| match index.resolve(&selection.lookup) {
                Some(value) => Some(NamedMetric {
                    name: selection.name.clone(),
                    value,
                    unit: selection.unit.clone(),
                    dimensions: selection.dimensions.clone(),
                }),
                None => {
                    error!(
                        metric = %selection.name,
                        lookup = %selection.lookup,
                        "metric source measurement not found"
                    );
                    None
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputStatus {
    NotAttempted,
    Delivered,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub timestamp_ms: u64,
    pub devices: usize,
    pub fetch_failures: usize,
    /// Devices that were fetched but produced no measurement.
    pub empty_devices: usize,
    pub measurements: usize,
    pub derived: usize,
    pub duplicates: usize,
    pub timeseries: OutputStatus,
    pub metrics: OutputStatus,
}

impl CycleReport {
    fn idle(timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            devices: 0,
            fetch_failures: 0,
            empty_devices: 0,
            measurements: 0,
            derived: 0,
            duplicates: 0,
            timeseries: OutputStatus::NotAttempted,
            metrics: OutputStatus::NotAttempted,
        }
    }

    /// True when enumeration yielded nothing to poll.
    pub fn is_idle(&self) -> bool {
        self.devices == 0
    }
}

/// Serves a fixed device list instead of asking the vendor.
#[derive(Debug, Clone)]
pub struct StaticInventory {
    devices: Vec<DeviceDescriptor>,
}

impl StaticInventory {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceSource for StaticInventory {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, CollaboratorError> {
        Ok(self.devices.clone())
    }
}

/// Runs poll-normalize-derive-publish cycles against injected collaborators.
pub struct CycleRunner {
    devices: Arc<dyn DeviceSource>,
    telemetry: Arc<dyn TelemetrySource>,
    timeseries: Arc<dyn TimeSeriesSink>,
    metrics: Arc<dyn MetricsSink>,
    pipeline: Pipeline,
    config: CycleConfig,
}

impl CycleRunner {
    pub fn new(
        devices: Arc<dyn DeviceSource>,
        telemetry: Arc<dyn TelemetrySource>,
        timeseries: Arc<dyn TimeSeriesSink>,
        metrics: Arc<dyn MetricsSink>,
        pipeline: Pipeline,
        config: CycleConfig,
    ) -> Self {
        Self {
            devices,
            telemetry,
            timeseries,
            metrics,
            pipeline,
            config,
        }
    }

    /// Runs one cycle stamped with the current (truncated) wall-clock time.
    pub async fn run_once(&self) -> CycleReport {
        let timestamp_ms = cycle_timestamp(unix_ms(), self.config.timestamp_granularity_ms);
        self.run_cycle(timestamp_ms).await
    }

    /// Runs one complete cycle. Partial failures are logged and counted in
    /// the report; nothing here aborts the cycle once devices are known.
    pub async fn run_cycle(&self, timestamp_ms: u64) -> CycleReport {
        metrics::counter!("collector_cycles_total").increment(1);
        let mut report = CycleReport::idle(timestamp_ms);

        let devices = match self.devices.list_devices().await {
            Ok(devices) => devices,
            Err(err) => {
                metrics::counter!("collector_enumeration_failures_total").increment(1);
                warn!(error = %err, "device enumeration failed, nothing to do this cycle");
                return report;
            }
        };
        if devices.is_empty() {
            warn!("no devices listed, nothing to do this cycle");
            return report;
        }
        report.devices = devices.len();

        let mut measurements = Vec::new();
        for device in &devices {
            let raw = match self.telemetry.fetch(&device.device_id).await {
                Ok(raw) => raw,
                Err(err) => {
                    report.fetch_failures += 1;
                    metrics::counter!("collector_fetch_failures_total").increment(1);
                    warn!(
                        device = %device.device_id,
                        category = %device.category,
                        error = %err,
                        "telemetry fetch failed"
                    );
                    continue;
                }
            };

            let normalized = normalize_device(self.pipeline.table(), device, &raw);
            if normalized.is_empty() {
                report.empty_devices += 1;
            }
            measurements.extend(normalized);
        }

        let (mut measurements, duplicates) = dedupe(measurements);
        report.measurements = measurements.len();

        let derived = derive(&measurements, &self.pipeline.derivations);
        measurements.extend(derived);
        let (measurements, derived_duplicates) = dedupe(measurements);
        report.derived = measurements.len() - report.measurements;
        report.duplicates = duplicates + derived_duplicates;

        let batch = MeasurementBatch::new(timestamp_ms, measurements);
        report.timeseries = self.write_timeseries(&batch).await;

        let selected = self.pipeline.select_metrics(&batch.measurements);
        report.metrics = self.publish_metrics(&selected).await;

        metrics::gauge!("collector_last_cycle_measurements").set(batch.len() as f64);
        info!(
            timestamp_ms,
            devices = report.devices,
            fetch_failures = report.fetch_failures,
            measurements = report.measurements,
            derived = report.derived,
            duplicates = report.duplicates,
            "poll cycle complete"
        );
        report
    }

    async fn write_timeseries(&self, batch: &MeasurementBatch) -> OutputStatus {
        if batch.is_empty() {
            warn!("no measurements collected, skipping time-series write");
            return OutputStatus::NotAttempted;
        }

        debug!(summary = %batch_summary(batch), "writing time-series batch");
        match self.timeseries.write_batch(batch).await {
            Ok(()) => OutputStatus::Delivered,
            Err(err) => {
                metrics::counter!("collector_write_failures_total").increment(1);
                error!(
                    error = %err,
                    summary = %batch_summary(batch),
                    "time-series write failed"
                );
                OutputStatus::Failed(err.to_string())
            }
        }
    }

    async fn publish_metrics(&self, selected: &[NamedMetric]) -> OutputStatus {
        if selected.is_empty() {
            return OutputStatus::NotAttempted;
        }

        match self.metrics.publish(selected).await {
            Ok(()) => OutputStatus::Delivered,
            Err(err) => {
                metrics::counter!("collector_publish_failures_total").increment(1);
                let names: Vec<&str> = selected.iter().map(|metric| metric.name.as_str()).collect();
                error!(error = %err, metrics = ?names, "metrics publish failed");
                OutputStatus::Failed(err.to_string())
            }
        }
    }

    /// Polls until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut iteration = 0u64;

        loop {
            if *shutdown.borrow() {
                info!("cycle loop shutdown requested");
                break;
            }

            let cycle_start = Instant::now();
            let report = self.run_once().await;

            iteration = iteration.wrapping_add(1);
            let elapsed = cycle_start.elapsed();
            let lag = elapsed.saturating_sub(self.config.poll_interval);
            let delay = jittered_delay(self.config.poll_interval, self.config.jitter_ms, iteration);
            info!(
                elapsed_ms = elapsed.as_millis(),
                lag_ms = lag.as_millis(),
                idle = report.is_idle(),
                delay_ms = delay.as_millis(),
                "waiting for next cycle"
            );

            tokio::select! {
                _ = sleep(delay) => {},
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("cycle loop shutdown requested");
                        break;
                    }
                }
            }
        }
    }
}

/// Drops repeated (identity, sub-channel, kind) entries; the first one wins.
pub fn dedupe(measurements: Vec<Measurement>) -> (Vec<Measurement>, usize) {
    let mut seen = HashSet::with_capacity(measurements.len());
    let mut kept = Vec::with_capacity(measurements.len());
    let mut dropped = 0usize;

    for measurement in measurements {
        let key = (
            measurement.device_identity.clone(),
            measurement.sub_channel.clone(),
            measurement.measure_kind.clone(),
        );
        if seen.insert(key) {
            kept.push(measurement);
        } else {
            dropped += 1;
            warn!(channel = %measurement.key(), "dropping duplicate measurement");
        }
    }

    (kept, dropped)
}

pub fn cycle_timestamp(now_ms: u64, granularity_ms: u64) -> u64 {
    if granularity_ms == 0 {
        return now_ms;
    }
    now_ms - now_ms % granularity_ms
}

fn batch_summary(batch: &MeasurementBatch) -> String {
    let devices: HashSet<&str> = batch
        .measurements
        .iter()
        .map(|m| m.device_identity.as_str())
        .collect();
    let mut devices: Vec<&str> = devices.into_iter().collect();
    devices.sort_unstable();
    format!(
        "{} points at {} from [{}]",
        batch.len(),
        batch.timestamp_ms,
        devices.join(", ")
    )
}

fn jittered_delay(base: Duration, jitter_ms: u64, iteration: u64) -> Duration {
    if jitter_ms == 0 {
        return base;
    }

    let jitter_window = jitter_ms.max(1);
    let seed = unix_ms().wrapping_add(iteration.wrapping_mul(1_664_525));
    let offset = seed % jitter_window;
    base + Duration::from_millis(offset)
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_truncate_to_granularity() {
        assert_eq!(cycle_timestamp(1_700_000_059_999, 60_000), 1_700_000_040_000);
        assert_eq!(cycle_timestamp(1_700_000_059_999, 0), 1_700_000_059_999);
    }

    #[test]
    fn jitter_stays_inside_window() {
        let base = Duration::from_secs(60);
        assert_eq!(jittered_delay(base, 0, 7), base);
        for iteration in 0..32 {
            let delay = jittered_delay(base, 500, iteration);
            assert!(delay >= base && delay < base + Duration::from_millis(500));
        }
    }
}
