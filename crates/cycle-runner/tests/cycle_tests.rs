use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use cycle_runner::{
    CycleConfig, CycleRunner, MetricSelection, OutputStatus, Pipeline, StaticInventory,
};
use derivation::{DerivationRule, Sign};
use field_map::FieldTable;
use types::{
    CollaboratorError, DeviceDescriptor, DeviceSource, MeasureKind, MeasurementBatch, MetricsSink,
    NamedMetric, RawTelemetry, TelemetrySource, TimeSeriesSink,
};

const TS: u64 = 1_700_000_040_000;

struct FailingInventory;

#[async_trait]
impl DeviceSource for FailingInventory {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, CollaboratorError> {
        Err(CollaboratorError::enumeration("device list returned 401"))
    }
}

#[derive(Default)]
struct CannedTelemetry {
    payloads: HashMap<String, RawTelemetry>,
    calls: Mutex<Vec<String>>,
}

impl CannedTelemetry {
    fn with(mut self, device_id: &str, payload: serde_json::Value) -> Self {
        let raw = serde_json::from_value(payload).expect("telemetry object");
        self.payloads.insert(device_id.to_string(), raw);
        self
    }
}

#[async_trait]
impl TelemetrySource for CannedTelemetry {
    async fn fetch(&self, device_id: &str) -> Result<RawTelemetry, CollaboratorError> {
        self.calls.lock().expect("calls lock").push(device_id.to_string());
        self.payloads
            .get(device_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::fetch(device_id, "503 service unavailable"))
    }
}

#[derive(Default)]
struct RecordingSink {
    batches: Mutex<Vec<MeasurementBatch>>,
    published: Mutex<Vec<Vec<NamedMetric>>>,
    fail_writes: bool,
}

#[async_trait]
impl TimeSeriesSink for RecordingSink {
    async fn write_batch(&self, batch: &MeasurementBatch) -> Result<(), CollaboratorError> {
        self.batches.lock().expect("batches lock").push(batch.clone());
        if self.fail_writes {
            return Err(CollaboratorError::write(batch.len(), "throttled"));
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsSink for RecordingSink {
    async fn publish(&self, metrics: &[NamedMetric]) -> Result<(), CollaboratorError> {
        self.published
            .lock()
            .expect("published lock")
            .push(metrics.to_vec());
        Ok(())
    }
}

fn device(device_id: &str, category: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        device_id: device_id.to_string(),
        category: category.to_string(),
        display_name: format!("{category} {device_id}"),
        sku: "SKU".to_string(),
    }
}

fn inventory() -> Vec<DeviceDescriptor> {
    vec![
        device("1000914", "Controller"),
        device("1000258", "Battery Shunt"),
        device("1000071", "Battery Shunt"),
    ]
}

fn telemetry() -> CannedTelemetry {
    CannedTelemetry::default()
        .with(
            "1000914",
            json!({"gridChargeAmps": 5000, "auxiliaryBatteryChargingVolts": 13.2}),
        )
        .with("1000258", json!({"batteryVolts": 13.1, "power": 10.0}))
        .with("1000071", json!({"batteryVolts": 13.08, "power": 3.0}))
}

fn pipeline() -> Pipeline {
    Pipeline::new(
        FieldTable::renogy("power"),
        vec![DerivationRule::net_load(
            "load-001",
            "RNG-SYST",
            "RNG-SYST",
            &["shnt-258", "mppt-914"],
            &["shnt-071"],
            "shnt-071",
            Sign::Positive,
        )],
        vec![MetricSelection::main_voltage("shnt-071")],
    )
    .expect("pipeline")
}

fn runner(
    devices: Arc<dyn DeviceSource>,
    telemetry: Arc<CannedTelemetry>,
    sink: Arc<RecordingSink>,
) -> CycleRunner {
    CycleRunner::new(
        devices,
        telemetry,
        sink.clone(),
        sink,
        pipeline(),
        CycleConfig::default(),
    )
}

fn derived_value(batch: &MeasurementBatch, kind: MeasureKind) -> Option<f64> {
    batch
        .measurements
        .iter()
        .find(|m| m.category_label == "derived" && m.measure_kind == kind)
        .map(|m| m.value)
}

#[tokio::test]
async fn full_cycle_writes_one_batch_with_derived_load() {
    let sink = Arc::new(RecordingSink::default());
    let runner = runner(
        Arc::new(StaticInventory::new(inventory())),
        Arc::new(telemetry()),
        sink.clone(),
    );

    let report = runner.run_cycle(TS).await;
    assert_eq!(report.devices, 3);
    assert_eq!(report.fetch_failures, 0);
    assert_eq!(report.measurements, 9);
    assert_eq!(report.derived, 3);
    assert_eq!(report.timeseries, OutputStatus::Delivered);
    assert_eq!(report.metrics, OutputStatus::Delivered);

    let batches = sink.batches.lock().expect("batches lock");
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.timestamp_ms, TS);
    assert_eq!(batch.len(), 12);
    assert_eq!(derived_value(batch, MeasureKind::Current), Some(12.0));
    assert_eq!(derived_value(batch, MeasureKind::Power), Some(157.76));
    assert_eq!(derived_value(batch, MeasureKind::Voltage), Some(13.08));

    let published = sink.published.lock().expect("published lock");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].len(), 1);
    assert_eq!(published[0][0].name, "MainVoltage");
    assert_eq!(published[0][0].value, 13.08);
    assert_eq!(
        published[0][0].dimensions,
        vec![("Device".to_string(), "Main".to_string())]
    );
}

#[tokio::test]
async fn failed_fetch_still_writes_partial_batch_once() {
    let sink = Arc::new(RecordingSink::default());
    let mut canned = telemetry();
    canned.payloads.remove("1000258");
    let canned = Arc::new(canned);
    let runner = runner(
        Arc::new(StaticInventory::new(inventory())),
        canned.clone(),
        sink.clone(),
    );

    let report = runner.run_cycle(TS).await;
    assert_eq!(report.devices, 3);
    assert_eq!(report.fetch_failures, 1);
    assert_eq!(report.measurements, 6);
    // Current and power need shnt-258; voltage only needs shnt-071.
    assert_eq!(report.derived, 1);
    assert_eq!(canned.calls.lock().expect("calls lock").len(), 3);

    let batches = sink.batches.lock().expect("batches lock");
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert!(batch
        .measurements
        .iter()
        .all(|m| m.device_identity != "shnt-258"));
    assert_eq!(derived_value(batch, MeasureKind::Current), None);
    assert_eq!(derived_value(batch, MeasureKind::Power), None);
    assert_eq!(derived_value(batch, MeasureKind::Voltage), Some(13.08));
}

#[tokio::test]
async fn enumeration_failure_is_idle() {
    let sink = Arc::new(RecordingSink::default());
    let canned = Arc::new(telemetry());
    let runner = runner(Arc::new(FailingInventory), canned.clone(), sink.clone());

    let report = runner.run_cycle(TS).await;
    assert!(report.is_idle());
    assert_eq!(report.timeseries, OutputStatus::NotAttempted);
    assert!(canned.calls.lock().expect("calls lock").is_empty());
    assert!(sink.batches.lock().expect("batches lock").is_empty());
    assert!(sink.published.lock().expect("published lock").is_empty());
}

#[tokio::test]
async fn write_failure_is_reported_and_metrics_still_publish() {
    let sink = Arc::new(RecordingSink {
        fail_writes: true,
        ..RecordingSink::default()
    });
    let runner = runner(
        Arc::new(StaticInventory::new(inventory())),
        Arc::new(telemetry()),
        sink.clone(),
    );

    let report = runner.run_cycle(TS).await;
    assert!(matches!(report.timeseries, OutputStatus::Failed(ref msg) if msg.contains("throttled")));
    assert_eq!(report.metrics, OutputStatus::Delivered);
    assert_eq!(sink.batches.lock().expect("batches lock").len(), 1);
}

#[tokio::test]
async fn unknown_categories_and_duplicates_do_not_break_the_cycle() {
    let mut devices = inventory();
    devices.push(device("1000071", "Battery Shunt"));
    devices.push(device("5555555", "Smart Battery"));
    let canned = telemetry().with("5555555", json!({"soc": 87}));

    let sink = Arc::new(RecordingSink::default());
    let runner = runner(
        Arc::new(StaticInventory::new(devices)),
        Arc::new(canned),
        sink.clone(),
    );

    let report = runner.run_cycle(TS).await;
    assert_eq!(report.devices, 5);
    assert_eq!(report.empty_devices, 1);
    assert_eq!(report.duplicates, 3);
    assert_eq!(report.measurements, 9);

    let batches = sink.batches.lock().expect("batches lock");
    let batch = &batches[0];
    let mut keys: Vec<String> = batch.measurements.iter().map(|m| m.key().to_string()).collect();
    let total = keys.len();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), total);
}

#[tokio::test]
async fn cycles_share_no_state() {
    let sink = Arc::new(RecordingSink::default());
    let mut canned = telemetry();
    canned.payloads.remove("1000914");
    let runner = runner(
        Arc::new(StaticInventory::new(inventory())),
        Arc::new(canned),
        sink.clone(),
    );

    let first = runner.run_cycle(TS).await;
    let second = runner.run_cycle(TS + 60_000).await;
    assert_eq!(first.measurements, second.measurements);
    assert_eq!(first.derived, second.derived);

    let batches = sink.batches.lock().expect("batches lock");
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].measurements, batches[1].measurements);
    assert_eq!(batches[1].timestamp_ms, TS + 60_000);
}
