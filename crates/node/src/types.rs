//! Shared data model: circuit/controller states, irrigation outcomes, the
//! result record, the durable per-circuit snapshot, and runtime status DTOs.
//!
//! The per-circuit transition table lives here as a pure function so the
//! state store and its tests can exercise it without any I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Controller state (derived, never persisted)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Idle,
    Irrigating,
    Stopping,
    Error,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Irrigating => write!(f, "IRRIGATING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-circuit state & events
// ---------------------------------------------------------------------------

/// Durable circuit state as written to `zones_state.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    Idle,
    Waiting,
    Irrigating,
    Disabled,
    Shutdown,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Irrigating => "irrigating",
            Self::Disabled => "disabled",
            Self::Shutdown => "shutdown",
        };
        write!(f, "{s}")
    }
}

/// Events driving the per-circuit state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEvent {
    ConfigEnabled,
    ConfigDisabled,
    /// Planner enqueued the circuit for the current cycle.
    Scheduled,
    /// Planner (or a worker) decided not to irrigate.
    SkipDecision,
    Start,
    /// An enqueued circuit is released without running.
    Cancel,
    Complete,
    Stop,
    /// Recovery after an unclean shutdown.
    Interrupt,
    Fault,
    Shutdown,
}

impl fmt::Display for CircuitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConfigEnabled => "config_enabled",
            Self::ConfigDisabled => "config_disabled",
            Self::Scheduled => "scheduled",
            Self::SkipDecision => "skip_decision",
            Self::Start => "start",
            Self::Cancel => "cancel",
            Self::Complete => "complete",
            Self::Stop => "stop",
            Self::Interrupt => "interrupt",
            Self::Fault => "fault",
            Self::Shutdown => "shutdown",
        };
        write!(f, "{s}")
    }
}

/// Apply `event` to `state`, returning the successor state or `None` when
/// the transition is not allowed.
pub fn next_state(state: CircuitState, event: CircuitEvent) -> Option<CircuitState> {
    use CircuitEvent as E;
    use CircuitState as S;

    // Clean exit is legal from every state.
    if event == E::Shutdown {
        return Some(S::Shutdown);
    }

    match (state, event) {
        (S::Disabled, E::ConfigEnabled) => Some(S::Idle),
        (S::Idle, E::ConfigDisabled) => Some(S::Disabled),
        (S::Idle, E::Scheduled) => Some(S::Waiting),
        (S::Idle, E::SkipDecision) => Some(S::Idle),
        (S::Idle, E::Start) => Some(S::Irrigating),
        (S::Waiting, E::Start) => Some(S::Irrigating),
        (S::Waiting, E::Cancel) => Some(S::Idle),
        (S::Irrigating, E::Complete) => Some(S::Idle),
        (S::Irrigating, E::Stop) => Some(S::Idle),
        (S::Irrigating, E::Interrupt) => Some(S::Idle),
        (S::Irrigating, E::Fault) => Some(S::Idle),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Outcomes & result record
// ---------------------------------------------------------------------------

/// Terminal classification of one irrigation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failed,
    Stopped,
    Interrupted,
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Interrupted => "interrupted",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// One entry in the append-only irrigation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrrigationResult {
    pub circuit_id: u32,
    pub success: bool,
    pub outcome: Outcome,
    pub start_time: DateTime<Utc>,
    /// Seconds actually run.
    pub completed_duration: u64,
    /// Seconds planned.
    pub target_duration: u64,
    /// Liters actually delivered.
    pub actual_volume: f64,
    /// Liters planned.
    pub target_volume: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IrrigationResult {
    pub fn success(
        circuit_id: u32,
        start_time: DateTime<Utc>,
        duration: u64,
        target_duration: u64,
        volume: f64,
    ) -> Self {
        Self {
            circuit_id,
            success: true,
            outcome: Outcome::Success,
            start_time,
            completed_duration: duration,
            target_duration,
            actual_volume: volume,
            target_volume: volume,
            error: None,
        }
    }

    pub fn stopped(
        circuit_id: u32,
        start_time: DateTime<Utc>,
        completed_duration: u64,
        target_duration: u64,
        actual_volume: f64,
        target_volume: f64,
    ) -> Self {
        Self {
            circuit_id,
            success: false,
            outcome: Outcome::Stopped,
            start_time,
            completed_duration,
            target_duration,
            actual_volume,
            target_volume,
            error: Some(format!(
                "irrigation stopped after {completed_duration} seconds"
            )),
        }
    }

    pub fn failed(
        circuit_id: u32,
        start_time: DateTime<Utc>,
        completed_duration: u64,
        target_duration: u64,
        actual_volume: f64,
        target_volume: f64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            circuit_id,
            success: false,
            outcome: Outcome::Failed,
            start_time,
            completed_duration,
            target_duration,
            actual_volume,
            target_volume,
            error: Some(error.into()),
        }
    }

    pub fn skipped(circuit_id: u32, start_time: DateTime<Utc>) -> Self {
        Self {
            circuit_id,
            success: false,
            outcome: Outcome::Skipped,
            start_time,
            completed_duration: 0,
            target_duration: 0,
            actual_volume: 0.0,
            target_volume: 0.0,
            error: None,
        }
    }

    pub fn interrupted(circuit_id: u32, start_time: DateTime<Utc>) -> Self {
        Self {
            circuit_id,
            success: false,
            outcome: Outcome::Interrupted,
            start_time,
            completed_duration: 0,
            target_duration: 0,
            actual_volume: 0.0,
            target_volume: 0.0,
            error: Some("irrigation interrupted by unclean shutdown".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Durable snapshot (zones_state.json)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub id: u32,
    pub circuit_state: CircuitState,
    pub last_decision: Option<DateTime<Utc>>,
    pub last_outcome: Option<Outcome>,
    pub last_irrigation: Option<DateTime<Utc>>,
    /// Seconds of the last real irrigation.
    pub last_duration: u64,
    /// Liters of the last real irrigation.
    pub last_volume: f64,
}

impl CircuitSnapshot {
    pub fn fresh(id: u32, enabled: bool) -> Self {
        Self {
            id,
            circuit_state: if enabled {
                CircuitState::Idle
            } else {
                CircuitState::Disabled
            },
            last_decision: None,
            last_outcome: None,
            last_irrigation: None,
            last_duration: 0,
            last_volume: 0.0,
        }
    }
}

/// Top-level shape of `zones_state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZonesStateFile {
    pub last_updated: DateTime<Utc>,
    pub circuits: Vec<CircuitSnapshot>,
}

// ---------------------------------------------------------------------------
// Runtime status (in-memory, rebuilt each run)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeStatus {
    pub target_volume: f64,
    pub current_volume: f64,
    pub target_duration: u64,
    pub elapsed_secs: u64,
    pub progress_percent: f64,
}

// ---------------------------------------------------------------------------
// Combined status (served to bridges)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub id: u32,
    pub name: String,
    pub enabled: bool,
    pub snapshot: CircuitSnapshot,
    /// Present only while a worker is executing this circuit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeStatus>,
    /// Present while the circuit is enqueued in the current plan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planned_volume: Option<f64>,
    pub has_fault: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub controller_state: ControllerState,
    pub auto_enabled: bool,
    pub auto_paused: bool,
    pub zones: Vec<CircuitStatus>,
}

impl ControllerStatus {
    /// Ids of zones with an active irrigation worker, ascending.
    pub fn irrigating_zones(&self) -> Vec<u32> {
        self.zones
            .iter()
            .filter(|z| z.runtime.is_some())
            .map(|z| z.id)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Round to 3 decimals. Volumes are reported in milliliter precision.
pub fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

// ===========================================================================
// Tests
// ===========================================================================
