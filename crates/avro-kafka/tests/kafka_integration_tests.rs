use avro_kafka::{KafkaConfig, Publisher};
use types::{MeasureKind, Measurement, MeasurementBatch};

#[tokio::test]
async fn kafka_publish_integration() {
    let brokers = match std::env::var("RENOGY_KAFKA_BROKERS") {
        Ok(value) => value,
        Err(_) => return,
    };
    let topic =
        std::env::var("RENOGY_KAFKA_TOPIC").unwrap_or_else(|_| "renogy.telemetry".to_string());

    let config = KafkaConfig {
        brokers,
        client_id: std::env::var("RENOGY_KAFKA_CLIENT_ID")
            .unwrap_or_else(|_| "renogy-collector-tests".to_string()),
        ..KafkaConfig::default()
    };

    let publisher =
        Publisher::new_kafka(Publisher::default_schema(), &topic, &config).expect("publisher init");

    let batch = MeasurementBatch::new(
        1_700_000_040_000,
        vec![Measurement {
            device_identity: "shnt-071".to_string(),
            category_label: "battery-shunt".to_string(),
            display_name: "RBM500".to_string(),
            sku: "RSHST".to_string(),
            measure_kind: MeasureKind::Voltage,
            sub_channel: Some("primary".to_string()),
            value: 13.08,
        }],
    );

    publisher.publish_batch(&batch).await.expect("publish");
}
