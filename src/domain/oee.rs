// OEE (Overall Equipment Effectiveness) calculation
use crate::domain::sample::{MachineState, Sample};
use serde::{Deserialize, Serialize};

/// Availability, Performance, Quality and their composition, all
/// percentages in [0, 100] rounded to two decimals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OeeMetrics {
    pub availability: f64,
    pub performance: f64,
    pub quality: f64,
    pub oee: f64,
}

impl OeeMetrics {
    /// Compose OEE from already-rounded component percentages.
    pub fn from_components(availability: f64, performance: f64, quality: f64) -> Self {
        let availability = round2(availability);
        let performance = round2(performance);
        let quality = round2(quality);
        Self {
            availability,
            performance,
            quality,
            oee: round2(availability * performance * quality / 10_000.0),
        }
    }

    pub fn zero() -> Self {
        Self::from_components(0.0, 0.0, 100.0)
    }
}

/// Derive OEE from a sample set against a nominal reference speed.
///
/// - Availability: share of samples in the Running state.
/// - Performance: mean of the speed channel over samples with a positive
///   reading, relative to `nominal_speed`, capped at 100 (a machine
///   briefly above nominal does not score beyond perfect).
/// - Quality: share of samples without an error code.
///
/// Rounding happens per component and once more after composition;
/// intermediate math stays unrounded so error does not compound.
pub fn compute_oee(samples: &[Sample], speed_channel: &str, nominal_speed: f64) -> OeeMetrics {
    let total = samples.len();
    if total == 0 {
        // Vacuously perfect quality, nothing running, nothing produced.
        return OeeMetrics::zero();
    }

    let running = samples
        .iter()
        .filter(|s| s.state == MachineState::Running)
        .count();
    let availability = running as f64 / total as f64 * 100.0;

    let speeds: Vec<f64> = samples
        .iter()
        .filter_map(|s| s.channel(speed_channel))
        .filter(|v| *v > 0.0)
        .collect();
    let performance = if speeds.is_empty() || nominal_speed <= 0.0 {
        0.0
    } else {
        let avg = speeds.iter().sum::<f64>() / speeds.len() as f64;
        (avg / nominal_speed * 100.0).min(100.0)
    };

    let errors = samples.iter().filter(|s| s.is_error()).count();
    let quality = (1.0 - errors as f64 / total as f64) * 100.0;

    OeeMetrics::from_components(availability, performance, quality)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
