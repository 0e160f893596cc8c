use std::time::Duration;

use apache_avro::{Schema, Writer};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use types::{CollaboratorError, MeasurementBatch, TimeSeriesSink};

/// Avro shape of one measurement point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointRecord {
    pub category: String,
    pub uname: String,
    pub name: String,
    pub sku: String,
    pub sub: String,
    pub measure: String,
    pub value: f64,
}

/// Avro shape of a whole cycle batch; all points share `time_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub time_ms: i64,
    pub points: Vec<PointRecord>,
}

impl From<&MeasurementBatch> for BatchRecord {
    fn from(batch: &MeasurementBatch) -> Self {
        Self {
            time_ms: i64::try_from(batch.timestamp_ms).unwrap_or(i64::MAX),
            points: batch
                .measurements
                .iter()
                .map(|m| PointRecord {
                    category: m.category_label.clone(),
                    uname: m.device_identity.clone(),
                    name: m.display_name.clone(),
                    sku: m.sku.clone(),
                    sub: m.sub_channel_or_none().to_string(),
                    measure: m.measure_kind.as_str().to_string(),
                    value: m.value,
                })
                .collect(),
        }
    }
}

#[derive(Clone)]
pub struct Publisher {
    schema: Schema,
    topic: String,
    producer: Option<FutureProducer>,
    timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub client_id: String,
    pub acks: String,
    pub compression: String,
    pub message_timeout_ms: u64,
    pub enable_idempotence: bool,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("schema", &self.schema)
            .field("topic", &self.topic)
            .field("producer", &self.producer.as_ref().map(|_| "FutureProducer"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Publisher {
    pub fn new_mock(schema: Schema, topic: impl Into<String>) -> Self {
        Self {
            schema,
            topic: topic.into(),
            producer: None,
            timeout: Duration::from_millis(0),
        }
    }

    pub fn new_kafka(
        schema: Schema,
        topic: impl Into<String>,
        config: &KafkaConfig,
    ) -> Result<Self, PublishError> {
        let timeout = Duration::from_millis(config.message_timeout_ms);
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("acks", &config.acks)
            .set("compression.type", &config.compression)
            .set(
                "enable.idempotence",
                if config.enable_idempotence { "true" } else { "false" },
            )
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .map_err(PublishError::KafkaConfig)?;

        Ok(Self {
            schema,
            topic: topic.into(),
            producer: Some(producer),
            timeout,
        })
    }

    pub fn is_mock(&self) -> bool {
        self.producer.is_none()
    }

    /// Encodes the batch as one Avro container and sends it as one message,
    /// keyed by the batch timestamp.
    pub async fn publish_batch(&self, batch: &MeasurementBatch) -> Result<(), PublishError> {
        let record = BatchRecord::from(batch);
        let payload = self.serialize(&record)?;
        let key = record.time_ms.to_string();
        debug!(points = record.points.len(), time_ms = record.time_ms, "encoded batch");
        self.publish_bytes(&key, &payload).await
    }

    pub async fn publish_bytes(&self, key: &str, payload: &[u8]) -> Result<(), PublishError> {
        match &self.producer {
            Some(producer) => {
                let record = FutureRecord::to(&self.topic).key(key).payload(payload);
                producer
                    .send(record, Timeout::After(self.timeout))
                    .await
                    .map_err(|(err, _)| PublishError::Kafka(err))?;
                Ok(())
            }
            None => {
                info!(topic = %self.topic, key, bytes = payload.len(), "mock publish invoked");
                Ok(())
            }
        }
    }

    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, PublishError> {
        let avro_value = apache_avro::to_value(value)
            .map_err(|err| PublishError::Encode(err.to_string()))?;
        let mut writer = Writer::with_codec(&self.schema, Vec::new(), apache_avro::Codec::Deflate);
        writer
            .append(avro_value)
            .map_err(|err| PublishError::Encode(err.to_string()))?;
        writer
            .flush()
            .map_err(|err| PublishError::Encode(err.to_string()))?;
        writer
            .into_inner()
            .map_err(|err| PublishError::Encode(err.to_string()))
    }

    pub fn default_schema() -> Schema {
        Schema::parse_str(DEFAULT_SCHEMA).expect("valid avro schema")
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl TimeSeriesSink for Publisher {
    async fn write_batch(&self, batch: &MeasurementBatch) -> Result<(), CollaboratorError> {
        self.publish_batch(batch)
            .await
            .map_err(|err| CollaboratorError::write(batch.len(), err))
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("avro encode error: {0}")]
    Encode(String),
    #[error("kafka config error: {0}")]
    KafkaConfig(rdkafka::error::KafkaError),
    #[error("kafka publish error: {0}")]
    Kafka(rdkafka::error::KafkaError),
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "renogy-collector".to_string(),
            acks: "all".to_string(),
            compression: "zstd".to_string(),
            message_timeout_ms: 5_000,
            enable_idempotence: true,
        }
    }
}

const DEFAULT_SCHEMA: &str = r#"
{
  "type": "record",
  "name": "MeasurementBatch",
  "namespace": "com.renogy.telemetry",
  "fields": [
    {"name": "time_ms", "type": "long"},
    {
      "name": "points",
      "type": {
        "type": "array",
        "items": {
          "type": "record",
          "name": "Point",
          "fields": [
            {"name": "category", "type": "string"},
            {"name": "uname", "type": "string"},
            {"name": "name", "type": "string"},
            {"name": "sku", "type": "string"},
            {"name": "sub", "type": "string"},
            {"name": "measure", "type": "string"},
            {"name": "value", "type": "double"}
          ]
        }
      }
    }
  ]
}
"#;
