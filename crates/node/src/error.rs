//! Typed error kinds for the controller subsystem.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::relay::ValveState;
use crate::types::{CircuitEvent, CircuitState};
use crate::workers::TaskType;

/// Configuration invariant violations. Fatal at bootstrap.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate circuit id {0}")]
    DuplicateCircuitId(u32),
    #[error("circuit {id}: {reason}")]
    InvalidCircuit { id: u32, reason: String },
    #[error("irrigation limits: min_percent {min} and max_percent {max} must satisfy min <= 100 <= max")]
    InvalidLimits { min: f64, max: f64 },
    #[error("automation: scheduled time {hour:02}:{minute:02} is out of range")]
    InvalidSchedule { hour: u8, minute: u8 },
}

/// Relay hardware failures after bounded retries.
#[derive(Debug, Error)]
pub enum ValveError {
    #[error("valve on pin {pin} failed to reach {target} after {attempts} attempts")]
    Hardware {
        pin: u8,
        target: ValveState,
        attempts: u32,
    },
}

/// Durable-state errors.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("circuit {circuit_id}: illegal transition {from} on {event}")]
    IllegalTransition {
        circuit_id: u32,
        from: CircuitState,
        event: CircuitEvent,
    },
    #[error("circuit {0} not found in state")]
    UnknownCircuit(u32),
    #[error("failed to persist {path}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Worker registry failures.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker already exists for {task}:{key}")]
    AlreadyExists { task: TaskType, key: String },
    #[error("{task} workers {pending:?} failed to stop within {timeout:?}")]
    StopTimeout {
        task: TaskType,
        pending: Vec<String>,
        timeout: Duration,
    },
}

/// Errors surfaced to the inbound command surface (MQTT/REST/CLI bridges).
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown circuit {0}")]
    UnknownCircuit(u32),
    #[error("circuit {0} is disabled")]
    CircuitDisabled(u32),
    #[error("invalid manual volume {volume} L (allowed 0 < v <= {max} L)")]
    InvalidVolume { volume: f64, max: f64 },
    #[error("controller is in error state; restart required")]
    Faulted,
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    State(#[from] StateError),
}
