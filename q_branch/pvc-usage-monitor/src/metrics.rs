//! Prometheus metrics for PVC capacity and usage.
//!
//! # Metric Families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `storage_requested_bytes` | Gauge | `pvcname`, `namespace`, `storageclass`, `pvname` |
//! | `storage_used_bytes` | Gauge | `pvcname`, `namespace`, `storageclass`, `pvname` |
//! | `pvc_usage_monitor_ticks_total` | Counter | `outcome` |
//! | `pvc_usage_monitor_skipped_records_total` | Counter | `reason` |
//! | `pvc_usage_monitor_last_tick_duration_seconds` | Gauge | |
//!
//! Gauges are overwritten on every tick. Label sets for claims that disappear
//! are never removed, so a deleted PVC keeps its last value until restart.

use prometheus::{Encoder, Gauge, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

/// Label names shared by both capacity gauges, in `with_label_values` order
pub const VOLUME_LABELS: [&str; 4] = ["pvcname", "namespace", "storageclass", "pvname"];

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Labels identifying one claim's gauges
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeLabels {
    pub pvc_name: String,
    pub namespace: String,
    pub storage_class_name: String,
    pub volume_name: String,
}

impl VolumeLabels {
    fn values(&self) -> [&str; 4] {
        [
            self.pvc_name.as_str(),
            self.namespace.as_str(),
            self.storage_class_name.as_str(),
            self.volume_name.as_str(),
        ]
    }
}

/// Joined result for one claim on one tick
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub labels: VolumeLabels,
    pub requested_bytes: f64,
    pub used_bytes: f64,
}

/// Destination for joined records.
///
/// `publish` must overwrite: writing the same label set twice leaves the
/// second value, never a sum.
pub trait MetricSink: Send + Sync {
    fn publish(&self, record: &MetricRecord);
}

/// Capacity gauges registered in a Prometheus registry
#[derive(Clone)]
pub struct PvcMetrics {
    requested_bytes: GaugeVec,
    used_bytes: GaugeVec,
}

impl PvcMetrics {
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let requested_bytes = GaugeVec::new(
            Opts::new(
                "storage_requested_bytes",
                "The number of bytes requested by the PVC",
            ),
            &VOLUME_LABELS,
        )?;
        registry.register(Box::new(requested_bytes.clone()))?;

        let used_bytes = GaugeVec::new(
            Opts::new(
                "storage_used_bytes",
                "The number of bytes used by the PVC's volume directory",
            ),
            &VOLUME_LABELS,
        )?;
        registry.register(Box::new(used_bytes.clone()))?;

        Ok(Self {
            requested_bytes,
            used_bytes,
        })
    }

    /// Current requested bytes for a label set.
    ///
    /// Reading an unknown label set creates it at 0, so this is meant for
    /// label sets that were already published.
    pub fn requested(&self, labels: &VolumeLabels) -> f64 {
        self.requested_bytes.with_label_values(&labels.values()).get()
    }

    /// Current used bytes for a label set; same caveat as [`Self::requested`]
    pub fn used(&self, labels: &VolumeLabels) -> f64 {
        self.used_bytes.with_label_values(&labels.values()).get()
    }
}

impl MetricSink for PvcMetrics {
    fn publish(&self, record: &MetricRecord) {
        let values = record.labels.values();
        self.requested_bytes
            .with_label_values(&values)
            .set(record.requested_bytes);
        self.used_bytes
            .with_label_values(&values)
            .set(record.used_bytes);
    }
}

/// How a tick ended, for `pvc_usage_monitor_ticks_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Published,
    ProbeFailed,
    ListFailed,
}

impl TickOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            TickOutcome::Published => "published",
            TickOutcome::ProbeFailed => "probe_failed",
            TickOutcome::ListFailed => "list_failed",
        }
    }
}

/// Health of the reconcile loop itself
#[derive(Clone)]
pub struct MonitorMetrics {
    ticks_total: IntCounterVec,
    skipped_records_total: IntCounterVec,
    last_tick_duration: Gauge,
}

impl MonitorMetrics {
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let ticks_total = IntCounterVec::new(
            Opts::new(
                "pvc_usage_monitor_ticks_total",
                "Reconcile ticks by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(ticks_total.clone()))?;

        let skipped_records_total = IntCounterVec::new(
            Opts::new(
                "pvc_usage_monitor_skipped_records_total",
                "Claims dropped from the join because they could not be converted",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(skipped_records_total.clone()))?;

        let last_tick_duration = Gauge::with_opts(Opts::new(
            "pvc_usage_monitor_last_tick_duration_seconds",
            "Wall time of the most recent reconcile tick",
        ))?;
        registry.register(Box::new(last_tick_duration.clone()))?;

        Ok(Self {
            ticks_total,
            skipped_records_total,
            last_tick_duration,
        })
    }

    pub fn tick_finished(&self, outcome: TickOutcome, duration_secs: f64) {
        self.ticks_total
            .with_label_values(&[outcome.as_str()])
            .inc();
        self.last_tick_duration.set(duration_secs);
    }

    pub fn record_skipped(&self, reason: &str) {
        self.skipped_records_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn ticks(&self, outcome: TickOutcome) -> u64 {
        self.ticks_total
            .with_label_values(&[outcome.as_str()])
            .get()
    }

    pub fn skipped(&self, reason: &str) -> u64 {
        self.skipped_records_total
            .with_label_values(&[reason])
            .get()
    }
}

/// Registry holding every family this process exports
pub struct MetricsRegistry {
    registry: Registry,
    pvc: PvcMetrics,
    monitor: MonitorMetrics,
}

impl MetricsRegistry {
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let pvc = PvcMetrics::new(&registry)?;
        let monitor = MonitorMetrics::new(&registry)?;
        Ok(Self {
            registry,
            pvc,
            monitor,
        })
    }

    pub fn pvc_metrics(&self) -> &PvcMetrics {
        &self.pvc
    }

    pub fn monitor_metrics(&self) -> &MonitorMetrics {
        &self.monitor
    }

    /// Encode all families in the Prometheus text exposition format
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}
