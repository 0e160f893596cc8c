use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tsdb::{StoreConfig, TimeSeriesStore};
use types::{MeasureKind, Measurement, MeasurementBatch, TimeSeriesSink};

fn measurement(identity: &str, kind: MeasureKind, sub: Option<&str>, value: f64) -> Measurement {
    Measurement {
        device_identity: identity.to_string(),
        category_label: "battery-shunt".to_string(),
        display_name: "RBM500".to_string(),
        sku: "RSHST-B02P300".to_string(),
        measure_kind: kind,
        sub_channel: sub.map(str::to_string),
        value,
    }
}

async fn open(path: &PathBuf) -> TimeSeriesStore {
    let config = StoreConfig {
        path: path.to_str().expect("path").to_string(),
        ..StoreConfig::default()
    };
    TimeSeriesStore::new(&config).await.expect("init")
}

#[tokio::test]
async fn batch_is_stored_with_shared_timestamp() {
    let path = temp_db_path("batch_is_stored_with_shared_timestamp");
    let store = open(&path).await;

    let batch = MeasurementBatch::new(
        1_700_000_040_000,
        vec![
            measurement("shnt-071", MeasureKind::Voltage, Some("primary"), 13.08),
            measurement("mppt-914", MeasureKind::Temperature, None, 77.0),
        ],
    );
    store.write_batch(&batch).await.expect("write");

    let points = store.points_at(1_700_000_040_000).await.expect("query");
    assert_eq!(points.len(), 2);
    assert_eq!(points[0].uname, "shnt-071");
    assert_eq!(points[0].measure, "voltage");
    assert_eq!(points[0].sub, "primary");
    assert_eq!(points[0].value, 13.08);
    assert_eq!(points[1].sub, "null");
    assert_eq!(points[1].measure, "temperature");
    assert!(points.iter().all(|p| p.time_ms == 1_700_000_040_000));

    drop(store);
    cleanup_db(&path);
}

#[tokio::test]
async fn prune_removes_only_older_points() {
    let path = temp_db_path("prune_removes_only_older_points");
    let store = open(&path).await;

    for ts in [60_000u64, 120_000, 180_000] {
        let batch = MeasurementBatch::new(
            ts,
            vec![measurement("shnt-258", MeasureKind::Current, Some("primary"), 10.0)],
        );
        store.insert_batch(&batch).await.expect("insert");
    }
    assert_eq!(store.point_count().await.expect("count"), 3);

    let removed = store.prune_before(120_000).await.expect("prune");
    assert_eq!(removed, 1);
    assert_eq!(store.point_count().await.expect("count"), 2);
    assert!(store.points_at(60_000).await.expect("query").is_empty());

    drop(store);
    cleanup_db(&path);
}

#[tokio::test]
async fn empty_batch_inserts_nothing() {
    let path = temp_db_path("empty_batch_inserts_nothing");
    let store = open(&path).await;

    let rows = store
        .insert_batch(&MeasurementBatch::new(60_000, Vec::new()))
        .await
        .expect("insert");
    assert_eq!(rows, 0);
    assert_eq!(store.point_count().await.expect("count"), 0);

    drop(store);
    cleanup_db(&path);
}

fn temp_db_path(prefix: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    path.push(format!("{prefix}-{pid}-{ts}.sqlite"));
    path
}

fn cleanup_db(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
    let wal = PathBuf::from(format!("{}-wal", path.display()));
    let shm = PathBuf::from(format!("{}-shm", path.display()));
    let _ = std::fs::remove_file(wal);
    let _ = std::fs::remove_file(shm);
}
