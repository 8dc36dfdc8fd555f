// HTTP transport over the upstream monitoring API
use crate::application::transport::MachineTransport;
use crate::domain::machine::Machine;
use crate::domain::oee::OeeMetrics;
use crate::domain::sample::{MachineState, Sample};
use crate::domain::segment::{Segment, Timeline};
use crate::domain::window::TimeWindow;
use crate::error::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

/// Live transport against the upstream HTTP API. The upstream serves
/// raw records plus pre-aggregated OEE, timeline and status-summary
/// endpoints, all bucketed by range token; windows are passed upstream
/// as their token, not as exact instants.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MachineListResponse {
    #[serde(default)]
    machines: Vec<RawMachine>,
}

#[derive(Debug, Deserialize)]
struct RawMachine {
    machine_id: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    technology: Option<String>,
    #[serde(default)]
    material: Option<String>,
    #[serde(default)]
    last_update: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDataResponse {
    #[serde(default)]
    data: Vec<RawRecord>,
}

/// One upstream record before validation. Everything beyond the fixed
/// fields is treated as a numeric channel; non-numeric extras are
/// dropped at this boundary so consumers never see defaulted values.
#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error_code: Option<i32>,
    #[serde(default)]
    error_text: Option<String>,
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OeeResponse {
    availability: f64,
    performance: f64,
    quality: f64,
}

#[derive(Debug, Deserialize)]
struct TimelineResponse {
    #[serde(default)]
    timeline: HashMap<String, Vec<RawSegment>>,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    status: String,
    start: String,
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct StatusSummaryResponse {
    #[serde(default)]
    summary: HashMap<String, f64>,
}

impl HttpTransport {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn machine_url(&self, machine_id: &str, resource: &str, window: &TimeWindow) -> String {
        format!(
            "{}/machines/{}/{}?range={}",
            self.base_url,
            urlencoding::encode(machine_id),
            resource,
            window.range.as_str()
        )
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, TransportError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::UpstreamStatus { status, body });
        }

        Ok(response.json::<T>().await?)
    }
}

/// Validate one raw record into a `Sample`. Records without a parseable
/// timestamp are rejected here, once, with a warning.
fn record_to_sample(machine_id: &str, record: RawRecord) -> Option<Sample> {
    let time = record.time.as_deref()?;
    let timestamp = match DateTime::parse_from_rfc3339(time) {
        Ok(t) => t.with_timezone(&Utc),
        Err(e) => {
            tracing::warn!(machine_id = %machine_id, time = %time, error = %e, "dropping record with bad timestamp");
            return None;
        }
    };

    let state = record
        .state
        .as_deref()
        .map(MachineState::parse)
        .unwrap_or(MachineState::Offline);

    let channels = record
        .extra
        .iter()
        .filter_map(|(key, value)| value.as_f64().map(|v| (key.clone(), v)))
        .collect();

    Some(Sample {
        machine_id: machine_id.to_string(),
        timestamp,
        state,
        channels,
        error_code: record.error_code,
        error_text: record.error_text,
    })
}

fn raw_machine_to_machine(raw: RawMachine) -> Machine {
    let state = raw
        .state
        .as_deref()
        .map(MachineState::parse)
        .unwrap_or(MachineState::Offline);
    Machine {
        machine_id: raw.machine_id,
        state,
        technology: raw.technology,
        material: raw.material,
        last_update: raw
            .last_update
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc)),
    }
}

fn raw_segment_to_segment(raw: &RawSegment) -> Option<Segment> {
    let start = DateTime::parse_from_rfc3339(&raw.start)
        .ok()?
        .with_timezone(&Utc);
    Some(Segment {
        status: MachineState::parse(&raw.status),
        start,
        duration_secs: raw.duration,
    })
}

#[async_trait]
impl MachineTransport for HttpTransport {
    async fn list_machines(&self) -> Result<Vec<Machine>, TransportError> {
        let url = format!("{}/machines", self.base_url);
        let response: MachineListResponse = self.get_json(&url).await?;
        Ok(response
            .machines
            .into_iter()
            .map(raw_machine_to_machine)
            .collect())
    }

    async fn fetch_samples(
        &self,
        machine_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<Sample>, TransportError> {
        let url = self.machine_url(machine_id, "raw-data", window);
        let response: RawDataResponse = self.get_json(&url).await?;
        Ok(response
            .data
            .into_iter()
            .filter_map(|record| record_to_sample(machine_id, record))
            .collect())
    }

    async fn fetch_oee(
        &self,
        machine_id: &str,
        window: &TimeWindow,
    ) -> Result<Option<OeeMetrics>, TransportError> {
        let url = self.machine_url(machine_id, "oee", window);
        let response: OeeResponse = self.get_json(&url).await?;
        // Recompose rather than trust the upstream's product, so both
        // delegated and local modes honor the same rounding invariant.
        Ok(Some(OeeMetrics::from_components(
            response.availability,
            response.performance,
            response.quality,
        )))
    }

    async fn fetch_timeline(
        &self,
        machine_id: &str,
        window: &TimeWindow,
    ) -> Result<Option<Timeline>, TransportError> {
        let url = self.machine_url(machine_id, "timeline", window);
        let mut response: TimelineResponse = self.get_json(&url).await?;

        let overview: Vec<Segment> = response
            .timeline
            .remove("overview")
            .unwrap_or_default()
            .iter()
            .filter_map(raw_segment_to_segment)
            .collect();

        let mut by_status: HashMap<MachineState, Vec<Segment>> = HashMap::new();
        for segment in &overview {
            by_status
                .entry(segment.status)
                .or_default()
                .push(segment.clone());
        }

        Ok(Some(Timeline { overview, by_status }))
    }

    async fn fetch_status_summary(
        &self,
        machine_id: &str,
        window: &TimeWindow,
    ) -> Result<Option<HashMap<MachineState, f64>>, TransportError> {
        let url = self.machine_url(machine_id, "status-summary", window);
        let response: StatusSummaryResponse = self.get_json(&url).await?;
        let mut summary: HashMap<MachineState, f64> = HashMap::new();
        for (state, seconds) in response.summary {
            *summary.entry(MachineState::parse(&state)).or_insert(0.0) += seconds;
        }
        Ok(Some(summary))
    }
}
