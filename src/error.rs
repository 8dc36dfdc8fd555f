// Error taxonomy for the aggregator
use thiserror::Error;

/// Failures reaching into the upstream source. The poller absorbs these
/// silently up to its failure threshold; only sustained failure surfaces
/// to consumers as a stale snapshot plus an error event. A transport
/// timeout is an ordinary `Request` failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream returned HTTP {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("malformed record from upstream: {0}")]
    Malformed(String),

    #[error("failed to load static dataset: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller-facing failures. `InvalidRange` is a programmer error and is
/// never retried. Empty upstream data is not an error anywhere: it maps
/// to defined zero-value outputs instead.
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("unrecognized time range token {0:?}")]
    InvalidRange(String),

    #[error("machine {0:?} is not listed upstream")]
    UnknownMachine(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
