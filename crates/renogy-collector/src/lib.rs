pub mod app;
pub mod config;
pub mod prometheus;

pub use config::{CollectorConfig, TimeseriesBackend};
pub use prometheus::PrometheusSink;
