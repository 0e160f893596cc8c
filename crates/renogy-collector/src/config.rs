use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use avro_kafka::KafkaConfig;
use cycle_runner::{CycleConfig, MetricSelection};
use derivation::{DerivationRule, Sign};
use renogy_client::ClientConfig;
use tsdb::StoreConfig;
use types::DeviceDescriptor;

const DEFAULT_SHUNT_CURRENT_FIELD: &str = "power";
const DEFAULT_METRICS_NAMESPACE: &str = "renogy";
const DEFAULT_KAFKA_TOPIC: &str = "renogy.telemetry";
const DEFAULT_LOAD_IDENTITY: &str = "load-001";
const DEFAULT_LOAD_NAME: &str = "RNG-SYST";
const DEFAULT_REFERENCE_SHUNT: &str = "shnt-071";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeseriesBackend {
    /// Logs a batch summary instead of storing it.
    Log,
    Sqlite,
    Kafka,
}

impl std::str::FromStr for TimeseriesBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "sqlite" => Ok(Self::Sqlite),
            "kafka" => Ok(Self::Kafka),
            other => anyhow::bail!("timeseries.backend must be log, sqlite or kafka (got {other})"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TimeseriesConfig {
    pub backend: TimeseriesBackend,
    pub sqlite: StoreConfig,
    pub retention_hours: Option<u64>,
    pub kafka_topic: String,
    /// `None` publishes through the mock producer.
    pub kafka: Option<KafkaConfig>,
}

impl Default for TimeseriesConfig {
    fn default() -> Self {
        Self {
            backend: TimeseriesBackend::Log,
            sqlite: StoreConfig::default(),
            retention_hours: None,
            kafka_topic: DEFAULT_KAFKA_TOPIC.to_string(),
            kafka: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CollectorConfig {
    pub api: ClientConfig,
    pub secrets_file: Option<String>,
    pub cycle: CycleConfig,
    /// When non-empty, replaces device enumeration.
    pub static_devices: Vec<DeviceDescriptor>,
    pub shunt_current_field: String,
    pub field_table_path: Option<String>,
    pub derivations: Vec<DerivationRule>,
    pub metric_selections: Vec<MetricSelection>,
    pub metrics_listen: Option<String>,
    pub metrics_namespace: String,
    pub timeseries: TimeseriesConfig,
}

impl CollectorConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config)?;

        if let Some(path) = config.secrets_file.clone() {
            let secrets = load_secrets(&path)?;
            config.api.access_key = secrets.access_key;
            config.api.secret_key = secrets.secret_key;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let host = self.api.host.trim();
        if !(host.starts_with("http://") || host.starts_with("https://")) {
            anyhow::bail!("api.host must be an http(s) URL");
        }
        if self.api.access_key.trim().is_empty() {
            anyhow::bail!("api.access_key must be set (RENOGY_ACCESS_KEY or api.secrets_file)");
        }
        if self.api.secret_key.trim().is_empty() {
            anyhow::bail!("api.secret_key must be set (RENOGY_SECRET_KEY or api.secrets_file)");
        }
        if self.api.timeout_ms == 0 {
            anyhow::bail!("api.timeout_ms must be >= 1");
        }
        if self.cycle.poll_interval.as_millis() == 0 {
            anyhow::bail!("cycle.poll_interval_ms must be >= 1");
        }
        if self.cycle.jitter_ms as u128 >= self.cycle.poll_interval.as_millis() {
            anyhow::bail!("cycle.jitter_ms must be smaller than cycle.poll_interval_ms");
        }
        for device in &self.static_devices {
            if device.device_id.trim().is_empty() || device.category.trim().is_empty() {
                anyhow::bail!("devices entries need a non-empty device_id and category");
            }
        }
        if self.shunt_current_field.trim().is_empty() {
            anyhow::bail!("field_map.shunt_current_field must be non-empty");
        }
        for rule in &self.derivations {
            rule.validate()
                .with_context(|| format!("derivations entry {}", rule.identity))?;
        }
        for selection in &self.metric_selections {
            if selection.name.trim().is_empty() {
                anyhow::bail!("metrics.selections entries need a non-empty name");
            }
        }
        if let Some(ref listen) = self.metrics_listen {
            listen
                .parse::<SocketAddr>()
                .map_err(|_| anyhow::anyhow!("metrics.listen must be host:port (got {listen})"))?;
        }
        validate_namespace(&self.metrics_namespace)?;

        match self.timeseries.backend {
            TimeseriesBackend::Log => {}
            TimeseriesBackend::Sqlite => {
                if self.timeseries.sqlite.path.trim().is_empty() {
                    anyhow::bail!("timeseries.sqlite_path must be non-empty");
                }
                if self.timeseries.retention_hours == Some(0) {
                    anyhow::bail!("timeseries.retention_hours must be >= 1 when set");
                }
            }
            TimeseriesBackend::Kafka => {
                validate_kafka_topic(&self.timeseries.kafka_topic)?;
                if let Some(ref kafka) = self.timeseries.kafka {
                    if kafka.brokers.trim().is_empty() {
                        anyhow::bail!("kafka.brokers must be non-empty when set");
                    }
                    if kafka.message_timeout_ms == 0 {
                        anyhow::bail!("kafka.timeout_ms must be >= 1");
                    }
                }
            }
        }

        Ok(())
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            api: ClientConfig::default(),
            secrets_file: None,
            cycle: CycleConfig::default(),
            static_devices: Vec::new(),
            shunt_current_field: DEFAULT_SHUNT_CURRENT_FIELD.to_string(),
            field_table_path: None,
            derivations: vec![default_load_rule()],
            metric_selections: vec![MetricSelection::main_voltage(DEFAULT_REFERENCE_SHUNT)],
            metrics_listen: None,
            metrics_namespace: DEFAULT_METRICS_NAMESPACE.to_string(),
            timeseries: TimeseriesConfig::default(),
        }
    }
}

/// Net load of the deployed system: charge sources minus the house shunt.
pub fn default_load_rule() -> DerivationRule {
    DerivationRule::net_load(
        DEFAULT_LOAD_IDENTITY,
        DEFAULT_LOAD_NAME,
        DEFAULT_LOAD_NAME,
        &["shnt-258", "mppt-914"],
        &[DEFAULT_REFERENCE_SHUNT],
        DEFAULT_REFERENCE_SHUNT,
        Sign::Positive,
    )
}

fn apply_env_overrides(config: &mut CollectorConfig) -> Result<()> {
    if let Ok(value) = env::var("RENOGY_API_HOST") {
        config.api.host = value;
    }
    if let Ok(value) = env::var("RENOGY_ACCESS_KEY") {
        config.api.access_key = value;
    }
    if let Ok(value) = env::var("RENOGY_SECRET_KEY") {
        config.api.secret_key = value;
    }
    if let Some(timeout_ms) = parse_env_u64("RENOGY_API_TIMEOUT_MS") {
        config.api.timeout_ms = timeout_ms;
    }
    config.secrets_file = env::var("RENOGY_SECRETS_FILE").ok().or(config.secrets_file.take());

    if let Some(interval_ms) = parse_env_u64("RENOGY_POLL_INTERVAL_MS") {
        config.cycle.poll_interval = Duration::from_millis(interval_ms);
    }
    if let Some(jitter_ms) = parse_env_u64("RENOGY_JITTER_MS") {
        config.cycle.jitter_ms = jitter_ms;
    }
    if let Some(granularity) = parse_env_u64("RENOGY_TIMESTAMP_GRANULARITY_MS") {
        config.cycle.timestamp_granularity_ms = granularity;
    }

    if let Ok(value) = env::var("RENOGY_STATIC_DEVICES") {
        config.static_devices = parse_static_devices(&value);
    }
    if let Ok(value) = env::var("RENOGY_SHUNT_CURRENT_FIELD") {
        config.shunt_current_field = value;
    }
    config.field_table_path = env::var("RENOGY_FIELD_TABLE")
        .ok()
        .or(config.field_table_path.take());

    config.metrics_listen = env::var("RENOGY_METRICS_LISTEN").ok().or(config.metrics_listen.take());
    if let Ok(value) = env::var("RENOGY_METRICS_NAMESPACE") {
        config.metrics_namespace = value;
    }

    if let Ok(value) = env::var("RENOGY_TIMESERIES_BACKEND") {
        config.timeseries.backend = value.parse()?;
    }
    if let Ok(value) = env::var("RENOGY_SQLITE_PATH") {
        config.timeseries.sqlite.path = value;
    }
    config.timeseries.retention_hours =
        parse_env_u64("RENOGY_SQLITE_RETENTION_HOURS").or(config.timeseries.retention_hours);
    if let Ok(value) = env::var("RENOGY_KAFKA_TOPIC") {
        config.timeseries.kafka_topic = value;
    }
    if let Ok(brokers) = env::var("RENOGY_KAFKA_BROKERS") {
        config.timeseries.kafka.get_or_insert_with(KafkaConfig::default).brokers = brokers;
    }
    if let Some(kafka) = config.timeseries.kafka.as_mut() {
        if let Ok(value) = env::var("RENOGY_KAFKA_CLIENT_ID") {
            kafka.client_id = value;
        }
        if let Ok(value) = env::var("RENOGY_KAFKA_ACKS") {
            kafka.acks = value;
        }
        if let Ok(value) = env::var("RENOGY_KAFKA_COMPRESSION") {
            kafka.compression = value;
        }
        if let Some(timeout_ms) = parse_env_u64("RENOGY_KAFKA_TIMEOUT_MS") {
            kafka.message_timeout_ms = timeout_ms;
        }
        if let Some(enable) = parse_env_bool("RENOGY_KAFKA_IDEMPOTENCE") {
            kafka.enable_idempotence = enable;
        }
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    api: Option<FileApiConfig>,
    cycle: Option<FileCycleConfig>,
    devices: Option<Vec<FileDeviceConfig>>,
    field_map: Option<FileFieldMapConfig>,
    derivations: Option<Vec<DerivationRule>>,
    metrics: Option<FileMetricsConfig>,
    timeseries: Option<FileTimeseriesConfig>,
    kafka: Option<KafkaConfig>,
}

#[derive(Debug, Deserialize)]
struct FileApiConfig {
    host: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
    secrets_file: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileCycleConfig {
    poll_interval_ms: Option<u64>,
    jitter_ms: Option<u64>,
    timestamp_granularity_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileDeviceConfig {
    device_id: String,
    category: String,
    name: Option<String>,
    sku: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileFieldMapConfig {
    shunt_current_field: Option<String>,
    table_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileMetricsConfig {
    listen: Option<String>,
    namespace: Option<String>,
    selections: Option<Vec<MetricSelection>>,
}

#[derive(Debug, Deserialize)]
struct FileTimeseriesConfig {
    backend: Option<TimeseriesBackend>,
    sqlite_path: Option<String>,
    retention_hours: Option<u64>,
    kafka_topic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SecretsFile {
    #[serde(rename = "ACCESS_KEY")]
    access_key: String,
    #[serde(rename = "SECRET_KEY")]
    secret_key: String,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("RENOGY_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path).with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn load_secrets(path: &str) -> Result<SecretsFile> {
    let content = fs::read_to_string(path).with_context(|| format!("read secrets file {path}"))?;
    serde_json::from_str(&content).with_context(|| format!("parse secrets file {path}"))
}

fn apply_file_config(config: &mut CollectorConfig, file: FileConfig) {
    if let Some(api) = file.api {
        if let Some(host) = api.host {
            config.api.host = host;
        }
        if let Some(access_key) = api.access_key {
            config.api.access_key = access_key;
        }
        if let Some(secret_key) = api.secret_key {
            config.api.secret_key = secret_key;
        }
        if let Some(path) = api.secrets_file {
            config.secrets_file = Some(path);
        }
        if let Some(timeout_ms) = api.timeout_ms {
            config.api.timeout_ms = timeout_ms;
        }
    }

    if let Some(cycle) = file.cycle {
        if let Some(interval_ms) = cycle.poll_interval_ms {
            config.cycle.poll_interval = Duration::from_millis(interval_ms);
        }
        if let Some(jitter_ms) = cycle.jitter_ms {
            config.cycle.jitter_ms = jitter_ms;
        }
        if let Some(granularity) = cycle.timestamp_granularity_ms {
            config.cycle.timestamp_granularity_ms = granularity;
        }
    }

    if let Some(devices) = file.devices {
        config.static_devices = devices
            .into_iter()
            .map(|device| DeviceDescriptor {
                display_name: device.name.unwrap_or_else(|| device.category.clone()),
                sku: device.sku.unwrap_or_default(),
                device_id: device.device_id,
                category: device.category,
            })
            .collect();
    }

    if let Some(field_map) = file.field_map {
        if let Some(field) = field_map.shunt_current_field {
            config.shunt_current_field = field;
        }
        if let Some(path) = field_map.table_path {
            config.field_table_path = Some(path);
        }
    }

    if let Some(derivations) = file.derivations {
        config.derivations = derivations;
    }

    if let Some(metrics) = file.metrics {
        if let Some(listen) = metrics.listen {
            config.metrics_listen = Some(listen);
        }
        if let Some(namespace) = metrics.namespace {
            config.metrics_namespace = namespace;
        }
        if let Some(selections) = metrics.selections {
            config.metric_selections = selections;
        }
    }

    if let Some(timeseries) = file.timeseries {
        if let Some(backend) = timeseries.backend {
            config.timeseries.backend = backend;
        }
        if let Some(path) = timeseries.sqlite_path {
            config.timeseries.sqlite.path = path;
        }
        if let Some(hours) = timeseries.retention_hours {
            config.timeseries.retention_hours = Some(hours);
        }
        if let Some(topic) = timeseries.kafka_topic {
            config.timeseries.kafka_topic = topic;
        }
    }

    if let Some(kafka) = file.kafka {
        config.timeseries.kafka = Some(kafka);
    }
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

/// `id:category` pairs separated by commas; entries without a category are
/// dropped.
fn parse_static_devices(value: &str) -> Vec<DeviceDescriptor> {
    value
        .split(',')
        .filter_map(|entry| {
            let (device_id, category) = entry.trim().split_once(':')?;
            let (device_id, category) = (device_id.trim(), category.trim());
            if device_id.is_empty() || category.is_empty() {
                return None;
            }
            Some(DeviceDescriptor {
                device_id: device_id.to_string(),
                category: category.to_string(),
                display_name: category.to_string(),
                sku: String::new(),
            })
        })
        .collect()
}

fn validate_namespace(namespace: &str) -> Result<()> {
    let mut chars = namespace.chars();
    let valid_start = chars
        .next()
        .map(|ch| ch.is_ascii_alphabetic() || ch == '_')
        .unwrap_or(false);
    if !valid_start || !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        anyhow::bail!("metrics.namespace must match [a-zA-Z_][a-zA-Z0-9_]*");
    }
    Ok(())
}

fn validate_kafka_topic(topic: &str) -> Result<()> {
    if topic.trim().is_empty() {
        anyhow::bail!("timeseries.kafka_topic must be non-empty");
    }
    if topic.len() > 249 {
        anyhow::bail!("timeseries.kafka_topic must be <= 249 characters");
    }
    if topic
        .chars()
        .any(|ch| !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-')
    {
        anyhow::bail!("timeseries.kafka_topic contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_devices_parse_pairs() {
        let devices = parse_static_devices("1000914:Controller, 1000071:Battery Shunt,bad,:x");
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].device_id, "1000071");
        assert_eq!(devices[1].category, "Battery Shunt");
    }

    #[test]
    fn namespace_rules() {
        assert!(validate_namespace("renogy").is_ok());
        assert!(validate_namespace("_solar_2").is_ok());
        assert!(validate_namespace("2solar").is_err());
        assert!(validate_namespace("solar-tel").is_err());
        assert!(validate_namespace("").is_err());
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("SQLite".parse::<TimeseriesBackend>().ok(), Some(TimeseriesBackend::Sqlite));
        assert!("influx".parse::<TimeseriesBackend>().is_err());
    }
}
