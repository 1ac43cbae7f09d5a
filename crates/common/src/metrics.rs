use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

use crate::ids::{OperatorId, StageId};

/// One observation reported by an operator stage.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorMetric {
    /// Elapsed time in microseconds.
    Timer { name: String, micros: u64 },
    /// Counter-like statistic.
    Stat { name: String, value: i64 },
    /// Free-form descriptive value (e.g. aggregation strategy).
    Blob { name: String, value: String },
}

impl OperatorMetric {
    pub fn timer(name: &str, micros: u64) -> Self {
        Self::Timer {
            name: name.to_string(),
            micros,
        }
    }

    pub fn stat(name: &str, value: i64) -> Self {
        Self::Stat {
            name: name.to_string(),
            value,
        }
    }

    pub fn blob(name: &str, value: impl Into<String>) -> Self {
        Self::Blob {
            name: name.to_string(),
            value: value.into(),
        }
    }
}

/// Observational sink for operator stage metrics. No operator behavior may
/// depend on it.
pub trait MetricsSink: Send + Sync {
    fn register_operator_stage_metrics(
        &self,
        operator_id: OperatorId,
        stage_id: StageId,
        metrics: Vec<OperatorMetric>,
    );
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn register_operator_stage_metrics(&self, _: OperatorId, _: StageId, _: Vec<OperatorMetric>) {}
}

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    operator_stats: GaugeVec,
    operator_time_seconds: HistogramVec,
    operator_info: GaugeVec,
    stage_reports: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for MetricsRegistry {
    fn register_operator_stage_metrics(
        &self,
        operator_id: OperatorId,
        stage_id: StageId,
        metrics: Vec<OperatorMetric>,
    ) {
        let op = operator_id.to_string();
        let stage = stage_id.to_string();
        self.inner
            .stage_reports
            .with_label_values(&[&op, &stage])
            .inc();
        for metric in metrics {
            match metric {
                OperatorMetric::Timer { name, micros } => {
                    self.inner
                        .operator_time_seconds
                        .with_label_values(&[&op, &stage, &name])
                        .observe(micros as f64 / 1_000_000.0);
                }
                OperatorMetric::Stat { name, value } => {
                    self.inner
                        .operator_stats
                        .with_label_values(&[&op, &stage, &name])
                        .set(value as f64);
                }
                OperatorMetric::Blob { name, value } => {
                    self.inner
                        .operator_info
                        .with_label_values(&[&op, &stage, &name, &value])
                        .set(1.0);
                }
            }
        }
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let operator_stats = gauge_vec(
            &registry,
            "tessera_operator_stat",
            "Operator stage statistics",
            &["operator_id", "stage_id", "metric"],
        );
        let operator_time_seconds = histogram_vec(
            &registry,
            "tessera_operator_time_seconds",
            "Operator stage timers",
            &["operator_id", "stage_id", "metric"],
        );
        let operator_info = gauge_vec(
            &registry,
            "tessera_operator_info",
            "Descriptive operator stage values",
            &["operator_id", "stage_id", "metric", "value"],
        );
        let stage_reports = counter_vec(
            &registry,
            "tessera_operator_stage_reports_total",
            "Number of stage metric reports per operator",
            &["operator_id", "stage_id"],
        );

        Self {
            registry,
            operator_stats,
            operator_time_seconds,
            operator_info,
            stage_reports,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}
