//! Snapshot size-growth alerts. Delivery is up to the caller.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeAlert {
    pub previous_bytes: u64,
    pub current_bytes: u64,
    pub growth_percent: f64,
}

/// Alerts when a snapshot grew by more than `threshold_percent` over the
/// previous one. A zero-sized predecessor never alerts.
pub fn check_growth(previous_bytes: u64, current_bytes: u64, threshold_percent: f64) -> Option<SizeAlert> {
    if previous_bytes == 0 {
        return None;
    }
    let growth_percent = (current_bytes as f64 - previous_bytes as f64) / previous_bytes as f64 * 100.0;
    (growth_percent > threshold_percent).then_some(SizeAlert {
        previous_bytes,
        current_bytes,
        growth_percent,
    })
}
