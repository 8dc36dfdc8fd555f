// Infrastructure layer - concrete transports and configuration
pub mod config;
pub mod http_transport;
pub mod static_transport;
