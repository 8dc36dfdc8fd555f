// Machine domain model
use crate::domain::sample::MachineState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A machine as reported by the upstream machine list, with its most
/// recently observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub machine_id: String,
    pub state: MachineState,
    #[serde(default)]
    pub technology: Option<String>,
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
}

impl Machine {
    pub fn new(machine_id: String, state: MachineState) -> Self {
        Self {
            machine_id,
            state,
            technology: None,
            material: None,
            last_update: None,
        }
    }
}
