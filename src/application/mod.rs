pub mod aggregator;
pub mod subscription;
pub mod transport;
