use crate::{AdmissionController, DispatchStats, Dispatcher, FetchError};
use metrics::{Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::info;

/// Handles registered through the `metrics` facade.
///
/// Without an installed recorder every handle is a no-op, so the service
/// records unconditionally and only pays for export when it is enabled.
pub struct Metrics {
    pub batches_admitted: Counter,
    pub batches_rejected: Counter,
    pub batches_succeeded: Counter,
    pub batches_failed: Counter,
    pub batch_duration: Histogram,
    pub in_flight_batches: Gauge,
    started: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            batches_admitted: metrics::register_counter!("fanout_batches_admitted_total"),
            batches_rejected: metrics::register_counter!("fanout_batches_rejected_total"),
            batches_succeeded: metrics::register_counter!("fanout_batches_succeeded_total"),
            batches_failed: metrics::register_counter!("fanout_batches_failed_total"),
            batch_duration: metrics::register_histogram!("fanout_batch_duration_seconds"),
            in_flight_batches: metrics::register_gauge!("fanout_in_flight_batches"),
            started: Instant::now(),
        }
    }

    pub fn record_admission(&self, in_flight: usize) {
        self.batches_admitted.increment(1);
        self.in_flight_batches.set(in_flight as f64);
    }

    pub fn record_rejection(&self) {
        self.batches_rejected.increment(1);
    }

    pub fn record_batch(&self, duration: Duration, outcome: Result<(), &FetchError>) {
        self.batch_duration.record(duration.as_secs_f64());

        match outcome {
            Ok(()) => self.batches_succeeded.increment(1),
            Err(err) => {
                self.batches_failed.increment(1);
                metrics::increment_counter!("fanout_fetch_errors_total", "kind" => err.kind());
            }
        }
    }

    pub fn set_in_flight(&self, in_flight: usize) {
        self.in_flight_batches.set(in_flight as f64);
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self, admission: &AdmissionController, dispatcher: &Dispatcher) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            admission: AdmissionSnapshot {
                capacity: admission.capacity(),
                in_flight: admission.in_flight(),
                admitted_total: admission.admitted_total(),
                rejected_total: admission.rejected_total(),
            },
            dispatch: dispatcher.stats(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the global Prometheus recorder.
///
/// Must run before [`Metrics::new`], otherwise the handles stay no-ops.
pub fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("Prometheus recorder installed");
    Ok(handle)
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub admission: AdmissionSnapshot,
    pub dispatch: DispatchStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    pub capacity: usize,
    pub in_flight: usize,
    pub admitted_total: u64,
    pub rejected_total: u64,
}
