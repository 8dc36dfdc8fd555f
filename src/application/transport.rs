// Transport trait for upstream telemetry access
use crate::domain::machine::Machine;
use crate::domain::oee::OeeMetrics;
use crate::domain::sample::{MachineState, Sample};
use crate::domain::segment::Timeline;
use crate::domain::window::TimeWindow;
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::HashMap;

/// The upstream telemetry source the aggregator polls.
///
/// Only `list_machines` and `fetch_samples` are required. The
/// pre-aggregated variants let a source that already computes OEE,
/// timelines or status summaries serve them directly; `Ok(None)` means
/// "not offered here", and the aggregator computes locally from raw
/// samples instead. Both paths honor the same invariants.
#[async_trait]
pub trait MachineTransport: Send + Sync {
    /// List all machines known upstream.
    async fn list_machines(&self) -> Result<Vec<Machine>, TransportError>;

    /// Raw time-series samples for a machine within a window.
    async fn fetch_samples(
        &self,
        machine_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<Sample>, TransportError>;

    /// Pre-aggregated OEE, when the upstream computes it server-side.
    async fn fetch_oee(
        &self,
        _machine_id: &str,
        _window: &TimeWindow,
    ) -> Result<Option<OeeMetrics>, TransportError> {
        Ok(None)
    }

    /// Pre-aggregated status timeline.
    async fn fetch_timeline(
        &self,
        _machine_id: &str,
        _window: &TimeWindow,
    ) -> Result<Option<Timeline>, TransportError> {
        Ok(None)
    }

    /// Pre-aggregated per-status duration totals.
    async fn fetch_status_summary(
        &self,
        _machine_id: &str,
        _window: &TimeWindow,
    ) -> Result<Option<HashMap<MachineState, f64>>, TransportError> {
        Ok(None)
    }
}
