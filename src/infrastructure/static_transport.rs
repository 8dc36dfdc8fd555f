// Static transport backed by an in-memory dataset
use crate::application::transport::MachineTransport;
use crate::domain::machine::Machine;
use crate::domain::sample::{MachineState, Sample};
use crate::domain::window::TimeWindow;
use crate::error::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Offline counterpart of the live HTTP transport: a fixed dataset
/// served through the same trait, windows answered by timestamp filter.
/// Offers no pre-aggregated variants, so the aggregator computes
/// everything locally.
#[derive(Debug, Clone, Default)]
pub struct StaticTransport {
    machines: Vec<Machine>,
    samples: HashMap<String, Vec<Sample>>,
}

#[derive(Debug, Deserialize)]
struct DatasetFile {
    #[serde(default)]
    machines: Vec<Machine>,
    #[serde(default)]
    samples: HashMap<String, Vec<DatasetSample>>,
}

#[derive(Debug, Deserialize)]
struct DatasetSample {
    time: DateTime<Utc>,
    state: MachineState,
    #[serde(default)]
    channels: HashMap<String, f64>,
    #[serde(default)]
    error_code: Option<i32>,
    #[serde(default)]
    error_text: Option<String>,
}

impl StaticTransport {
    pub fn new(machines: Vec<Machine>, samples: HashMap<String, Vec<Sample>>) -> Self {
        Self { machines, samples }
    }

    /// Load a JSON dataset from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let raw = std::fs::read_to_string(path)?;
        let dataset: DatasetFile = serde_json::from_str(&raw)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;

        let samples = dataset
            .samples
            .into_iter()
            .map(|(machine_id, records)| {
                let samples = records
                    .into_iter()
                    .map(|r| Sample {
                        machine_id: machine_id.clone(),
                        timestamp: r.time,
                        state: r.state,
                        channels: r.channels,
                        error_code: r.error_code,
                        error_text: r.error_text,
                    })
                    .collect();
                (machine_id, samples)
            })
            .collect();

        Ok(Self {
            machines: dataset.machines,
            samples,
        })
    }
}

#[async_trait]
impl MachineTransport for StaticTransport {
    async fn list_machines(&self) -> Result<Vec<Machine>, TransportError> {
        Ok(self.machines.clone())
    }

    async fn fetch_samples(
        &self,
        machine_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<Sample>, TransportError> {
        Ok(self
            .samples
            .get(machine_id)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| window.contains(s.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
