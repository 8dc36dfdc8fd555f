// Cached per-machine derived results
use crate::domain::oee::OeeMetrics;
use crate::domain::sample::{MachineState, Sample};
use crate::domain::segment::Timeline;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Everything derived for one machine in one refresh. Immutable once
/// built; the cache replaces the whole snapshot on every successful
/// fetch, so readers never see a half-updated view.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSnapshot {
    pub machine_id: String,
    pub latest_sample: Option<Sample>,
    pub current_oee: OeeMetrics,
    pub previous_oee: OeeMetrics,
    pub timeline: Timeline,
    pub status_durations: HashMap<MachineState, f64>,
    pub fetched_at: DateTime<Utc>,
}
