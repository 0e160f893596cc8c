use std::net::SocketAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use metrics::Label;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::sync::watch;
use tracing::{debug, info};

use types::{CollaboratorError, MetricsSink, NamedMetric};

/// Publishes curated metrics as gauges named `<namespace>_<metric name>`.
#[derive(Debug, Clone)]
pub struct PrometheusSink {
    namespace: String,
}

impl PrometheusSink {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn gauge_name(&self, metric: &NamedMetric) -> String {
        format!("{}_{}", self.namespace, metric.name)
    }

    /// Sets one gauge per metric on the installed recorder.
    pub fn record(&self, selected: &[NamedMetric]) {
        for metric in selected {
            let mut labels = vec![Label::new("unit", metric.unit.clone())];
            labels.extend(
                metric
                    .dimensions
                    .iter()
                    .map(|(key, value)| Label::new(key.clone(), value.clone())),
            );
            metrics::gauge!(self.gauge_name(metric), labels).set(metric.value);
            debug!(metric = %metric.name, value = metric.value, "gauge updated");
        }
    }
}

#[async_trait]
impl MetricsSink for PrometheusSink {
    async fn publish(&self, selected: &[NamedMetric]) -> Result<(), CollaboratorError> {
        self.record(selected);
        Ok(())
    }
}

pub fn install_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")
}

pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/healthz", get(healthz))
        .with_state(handle)
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serves `/metrics` and `/healthz` until `shutdown` flips to true.
pub async fn serve(
    listen: SocketAddr,
    handle: PrometheusHandle,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("bind metrics listener {listen}"))?;
    info!(%listen, "metrics endpoint listening");

    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .context("metrics server failed")
}
