use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{error, info, warn};

use avro_kafka::Publisher;
use cycle_runner::{CycleRunner, Pipeline, StaticInventory};
use field_map::{parse_table_from_json, FieldTable};
use renogy_client::RenogyClient;
use tsdb::TimeSeriesStore;
use types::{CollaboratorError, DeviceSource, MeasurementBatch, MetricsSink, TimeSeriesSink};

use crate::config::{CollectorConfig, TimeseriesBackend};

/// Time-series sink that only logs what would have been written.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl TimeSeriesSink for LogSink {
    async fn write_batch(&self, batch: &MeasurementBatch) -> Result<(), CollaboratorError> {
        for measurement in &batch.measurements {
            info!(
                time_ms = batch.timestamp_ms,
                channel = %measurement.key(),
                category = %measurement.category_label,
                value = measurement.value,
                "measurement"
            );
        }
        Ok(())
    }
}

pub fn build_pipeline(config: &CollectorConfig) -> Result<Pipeline> {
    let table = match config.field_table_path {
        Some(ref path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("read field table {path}"))?;
            parse_table_from_json(&content).with_context(|| format!("parse field table {path}"))?
        }
        None => FieldTable::renogy(&config.shunt_current_field),
    };

    Pipeline::new(
        table,
        config.derivations.clone(),
        config.metric_selections.clone(),
    )
    .context("invalid derivation rules")
}

pub async fn build_timeseries(config: &CollectorConfig) -> Result<Arc<dyn TimeSeriesSink>> {
    let timeseries = &config.timeseries;
    let sink: Arc<dyn TimeSeriesSink> = match timeseries.backend {
        TimeseriesBackend::Log => Arc::new(LogSink),
        TimeseriesBackend::Sqlite => {
            let store = TimeSeriesStore::new(&timeseries.sqlite)
                .await
                .context("time-series store init failed")?;
            if let Some(hours) = timeseries.retention_hours {
                spawn_retention(store.clone(), hours);
            }
            Arc::new(store)
        }
        TimeseriesBackend::Kafka => match timeseries.kafka {
            Some(ref kafka) => Arc::new(
                Publisher::new_kafka(Publisher::default_schema(), &timeseries.kafka_topic, kafka)
                    .context("kafka publisher init failed")?,
            ),
            None => {
                warn!("no kafka brokers configured, using mock publisher");
                Arc::new(Publisher::new_mock(
                    Publisher::default_schema(),
                    &timeseries.kafka_topic,
                ))
            }
        },
    };
    info!(backend = ?timeseries.backend, "time-series sink ready");
    Ok(sink)
}

pub fn build_runner(
    config: &CollectorConfig,
    timeseries: Arc<dyn TimeSeriesSink>,
    metrics: Arc<dyn MetricsSink>,
) -> Result<CycleRunner> {
    let client = Arc::new(RenogyClient::new(config.api.clone()).context("api client init failed")?);
    let devices: Arc<dyn DeviceSource> = if config.static_devices.is_empty() {
        client.clone()
    } else {
        info!(devices = config.static_devices.len(), "using static device inventory");
        Arc::new(StaticInventory::new(config.static_devices.clone()))
    };

    Ok(CycleRunner::new(
        devices,
        client,
        timeseries,
        metrics,
        build_pipeline(config)?,
        config.cycle.clone(),
    ))
}

/// Deletes stored points older than `hours`, once an hour.
fn spawn_retention(store: TimeSeriesStore, hours: u64) {
    let retention_ms = hours.saturating_mul(3_600_000);
    tokio::spawn(async move {
        loop {
            let cutoff = now_ms().saturating_sub(retention_ms);
            match store.prune_before(i64::try_from(cutoff).unwrap_or(i64::MAX)).await {
                Ok(deleted) if deleted > 0 => info!(deleted, "pruned old time-series points"),
                Ok(_) => {}
                Err(err) => error!(error = %err, "time-series prune failed"),
            }
            sleep(Duration::from_secs(3_600)).await;
        }
    });
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
