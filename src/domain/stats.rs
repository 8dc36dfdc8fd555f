// Rolling channel aggregates - chart-feed statistics over a window
use crate::domain::sample::Sample;
use serde::Serialize;

/// Min/max/avg/count over one numeric channel. Backs the trend charts;
/// the window and channel choice live with the caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: usize,
}

/// Aggregate one channel across a sample set. Samples that do not carry
/// the channel are skipped; `None` means no sample carried it at all,
/// which is an empty-data condition, not an error.
pub fn channel_stats(samples: &[Sample], channel: &str) -> Option<ChannelStats> {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    let mut count = 0usize;

    for value in samples.iter().filter_map(|s| s.channel(channel)) {
        min = min.min(value);
        max = max.max(value);
        sum += value;
        count += 1;
    }

    if count == 0 {
        return None;
    }
    Some(ChannelStats {
        min,
        max,
        avg: sum / count as f64,
        count,
    })
}
