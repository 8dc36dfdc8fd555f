use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub aggregator: AggregatorSettings,
    pub transport: TransportSettings,
}

/// Polling and computation policy for the aggregator.
#[derive(Debug, Deserialize, Clone)]
pub struct AggregatorSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive fetch failures before a machine's snapshot is marked
    /// stale and an error event is published.
    #[serde(default = "default_stale_after_failures")]
    pub stale_after_failures: u32,
    #[serde(default = "default_current_range")]
    pub current_range: String,
    #[serde(default = "default_previous_range")]
    pub previous_range: String,
    /// Channel used as the speed reading for the Performance component.
    #[serde(default = "default_speed_channel")]
    pub speed_channel: String,
    #[serde(default = "default_nominal_speed")]
    pub nominal_speed: f64,
    /// Per-machine nominal speed overrides.
    #[serde(default)]
    pub nominal_speeds: HashMap<String, f64>,
}

impl AggregatorSettings {
    pub fn nominal_speed_for(&self, machine_id: &str) -> f64 {
        self.nominal_speeds
            .get(machine_id)
            .copied()
            .unwrap_or(self.nominal_speed)
    }
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stale_after_failures: default_stale_after_failures(),
            current_range: default_current_range(),
            previous_range: default_previous_range(),
            speed_channel: default_speed_channel(),
            nominal_speed: default_nominal_speed(),
            nominal_speeds: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportSettings {
    pub mode: TransportMode,
    /// Base URL of the upstream API, e.g. "http://localhost:5000/api".
    #[serde(default)]
    pub base_url: Option<String>,
    /// Path to a JSON dataset for the static backend.
    #[serde(default)]
    pub dataset: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Http,
    Static,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_stale_after_failures() -> u32 {
    3
}

fn default_current_range() -> String {
    "24h".to_string()
}

fn default_previous_range() -> String {
    "7d".to_string()
}

fn default_speed_channel() -> String {
    "cutting_speed".to_string()
}

fn default_nominal_speed() -> f64 {
    100.0
}

pub fn load_config() -> anyhow::Result<AppConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/aggregator"))
        .build()?;

    Ok(settings.try_deserialize()?)
}
