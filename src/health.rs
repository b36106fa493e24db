use crate::AdmissionController;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

/// Share of admission slots in use above which the service reports a warning.
pub const WARNING_UTILIZATION: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthLevel,
    pub in_flight: usize,
    pub capacity: usize,
    pub version: &'static str,
    pub checked_at: DateTime<Utc>,
}

/// Derive the service health from admission pressure.
///
/// A full pool means new batches are being turned away, which is reported
/// as critical.
pub fn check_health(admission: &AdmissionController) -> HealthReport {
    let utilization = admission.utilization();

    let status = if admission.available() == 0 {
        warn!(
            in_flight = admission.in_flight(),
            capacity = admission.capacity(),
            "Admission pool exhausted"
        );
        HealthLevel::Critical
    } else if utilization >= WARNING_UTILIZATION {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    };

    HealthReport {
        status,
        in_flight: admission.in_flight(),
        capacity: admission.capacity(),
        version: env!("CARGO_PKG_VERSION"),
        checked_at: Utc::now(),
    }
}
