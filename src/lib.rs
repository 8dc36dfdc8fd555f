// Telemetry aggregation for CNC/laser machine monitoring: turns raw
// machine samples into OEE metrics, status timelines, per-status
// duration totals and rolling channel statistics, cached per machine
// and refreshed by a poller.
pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use application::aggregator::{Aggregator, SnapshotRead};
pub use application::subscription::{BusEvent, SubscriptionId};
pub use application::transport::MachineTransport;
pub use domain::stats::ChannelStats;
pub use error::{AggregatorError, TransportError};
