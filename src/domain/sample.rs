// Telemetry sample domain model
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Operating state reported by a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineState {
    Running,
    Idle,
    Error,
    Wait,
    Stopped,
    Offline,
}

impl MachineState {
    /// Parse an upstream state string. Unrecognized states fold into
    /// `Wait`, matching how the status views bucket them.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Running" => MachineState::Running,
            "Idle" => MachineState::Idle,
            "Error" => MachineState::Error,
            "Stopped" => MachineState::Stopped,
            "Offline" => MachineState::Offline,
            _ => MachineState::Wait,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Running => "Running",
            MachineState::Idle => "Idle",
            MachineState::Error => "Error",
            MachineState::Wait => "Wait",
            MachineState::Stopped => "Stopped",
            MachineState::Offline => "Offline",
        }
    }
}

/// One validated telemetry reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub machine_id: String,
    pub timestamp: DateTime<Utc>,
    pub state: MachineState,
    pub channels: HashMap<String, f64>,
    pub error_code: Option<i32>,
    pub error_text: Option<String>,
}

impl Sample {
    pub fn new(machine_id: String, timestamp: DateTime<Utc>, state: MachineState) -> Self {
        Self {
            machine_id,
            timestamp,
            state,
            channels: HashMap::new(),
            error_code: None,
            error_text: None,
        }
    }

    pub fn channel(&self, name: &str) -> Option<f64> {
        self.channels.get(name).copied()
    }

    /// An error sample carries a positive error code.
    pub fn is_error(&self) -> bool {
        self.error_code.is_some_and(|code| code > 0)
    }
}

/// Sort samples by timestamp ascending and collapse duplicate timestamps,
/// keeping the later arrival (last-write-wins).
pub fn normalize_samples(mut samples: Vec<Sample>) -> Vec<Sample> {
    // Stable sort preserves arrival order among equal timestamps.
    samples.sort_by_key(|s| s.timestamp);

    let mut normalized: Vec<Sample> = Vec::with_capacity(samples.len());
    for sample in samples {
        match normalized.last_mut() {
            Some(prev) if prev.timestamp == sample.timestamp => *prev = sample,
            _ => normalized.push(sample),
        }
    }
    normalized
}
