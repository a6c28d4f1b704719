//! Unified circuit status: durable snapshot ∪ live runtime ∪ planned
//! target. Served to the MQTT/REST/CLI bridges, plus the legacy one-line
//! text form the central server still parses.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::circuit::Circuit;
use crate::error::StateError;
use crate::planner::CyclePlan;
use crate::store::StateStore;
use crate::types::{CircuitState, CircuitStatus, ControllerStatus};

pub struct StatusAggregator {
    circuits: BTreeMap<u32, Arc<Circuit>>,
    store: Arc<StateStore>,
}

impl StatusAggregator {
    pub fn new(circuits: BTreeMap<u32, Arc<Circuit>>, store: Arc<StateStore>) -> Self {
        Self { circuits, store }
    }

    pub async fn circuit_status(
        &self,
        circuit_id: u32,
        plan: Option<&CyclePlan>,
    ) -> Result<CircuitStatus, StateError> {
        let circuit = self
            .circuits
            .get(&circuit_id)
            .ok_or(StateError::UnknownCircuit(circuit_id))?;
        let snapshot = self.store.snapshot(circuit_id).await?;

        // A planned target is only meaningful while the circuit still sits
        // in the queue.
        let planned_volume = if snapshot.circuit_state == CircuitState::Waiting {
            plan.and_then(|p| p.planned_volume(circuit_id))
        } else {
            None
        };

        Ok(CircuitStatus {
            id: circuit_id,
            name: circuit.name().to_string(),
            enabled: circuit.is_enabled(),
            snapshot,
            runtime: circuit.runtime_status(),
            planned_volume,
            has_fault: circuit.has_fault(),
            fault_reason: circuit.fault_reason(),
        })
    }

    pub async fn all_statuses(
        &self,
        plan: Option<&CyclePlan>,
    ) -> Result<Vec<CircuitStatus>, StateError> {
        let mut statuses = Vec::with_capacity(self.circuits.len());
        for &id in self.circuits.keys() {
            statuses.push(self.circuit_status(id, plan).await?);
        }
        Ok(statuses)
    }
}

/// Legacy single-line status, e.g.
/// `Controller State: IDLE, Auto Enabled: true, Auto Paused: false,
/// Currently Irrigating Zones: [1, 3]`.
pub fn status_message(status: &ControllerStatus) -> String {
    let zones = status
        .irrigating_zones()
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Controller State: {}, Auto Enabled: {}, Auto Paused: {}, Currently Irrigating Zones: [{zones}]",
        status.controller_state, status.auto_enabled, status.auto_paused
    )
}

// ===========================================================================
// Tests
// ===========================================================================
