// Run-length encoding of machine states into timeline segments
use crate::domain::sample::{normalize_samples, MachineState, Sample};
use crate::domain::window::TimeWindow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A maximal contiguous span during which the reported state is constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub status: MachineState,
    pub start: DateTime<Utc>,
    pub duration_secs: f64,
}

/// The Gantt view of one window: the full overview sequence plus the same
/// segments grouped per status.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Timeline {
    pub overview: Vec<Segment>,
    pub by_status: HashMap<MachineState, Vec<Segment>>,
}

impl Timeline {
    /// Total duration covered by the overview, in seconds.
    pub fn covered_secs(&self) -> f64 {
        self.overview.iter().map(|s| s.duration_secs).sum()
    }
}

/// Build the timeline for one machine over one window.
///
/// Samples are sorted by timestamp and deduplicated (last-write-wins)
/// before the walk. Each segment runs from the sample that opened it to
/// the sample that changed the state, and the final segment extends to
/// `window.end`. Segments of zero or negative duration are dropped, so
/// duplicate-timestamp artifacts never surface.
pub fn build_timeline(samples: &[Sample], window: &TimeWindow) -> Timeline {
    let samples = normalize_samples(samples.to_vec());

    let Some(first) = samples.first() else {
        return Timeline::default();
    };

    let mut overview = Vec::new();
    let mut current_status = first.state;
    let mut current_start = first.timestamp;

    for sample in &samples[1..] {
        if sample.state != current_status {
            push_segment(&mut overview, current_status, current_start, sample.timestamp);
            current_status = sample.state;
            current_start = sample.timestamp;
        }
    }
    push_segment(&mut overview, current_status, current_start, window.end);

    let mut by_status: HashMap<MachineState, Vec<Segment>> = HashMap::new();
    for segment in &overview {
        by_status.entry(segment.status).or_default().push(segment.clone());
    }

    Timeline { overview, by_status }
}

fn push_segment(
    overview: &mut Vec<Segment>,
    status: MachineState,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) {
    let duration_secs = (end - start).num_milliseconds() as f64 / 1000.0;
    if duration_secs > 0.0 {
        overview.push(Segment {
            status,
            start,
            duration_secs,
        });
    }
}

/// Sum segment durations per status across the whole window. The totals
/// over all statuses add up to the overview's covered duration.
pub fn status_durations(timeline: &Timeline) -> HashMap<MachineState, f64> {
    timeline
        .by_status
        .iter()
        .map(|(status, segments)| {
            (*status, segments.iter().map(|s| s.duration_secs).sum())
        })
        .collect()
}
