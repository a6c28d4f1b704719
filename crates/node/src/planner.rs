//! Cycle planning: picks the circuits due for irrigation today, records
//! skip decisions, and hands the rest to a batching strategy.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::circuit::Circuit;
use crate::conditions::ConditionsProvider;
use crate::config::NodeConfig;
use crate::error::StateError;
use crate::store::StateStore;
use crate::types::{CircuitEvent, IrrigationResult};

// ---------------------------------------------------------------------------
// Batching strategy
// ---------------------------------------------------------------------------

/// A circuit selected for execution, with its pre-computed target volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedCircuit {
    pub id: u32,
    pub volume: f64,
}

/// Groups planned circuits into ordered execution batches. Circuits within
/// a batch run in parallel; batches run sequentially.
///
/// Input arrives ordered by circuit id ascending and implementations must
/// preserve that order within each batch.
pub trait BatchStrategy: Send + Sync {
    fn plan(&self, circuits: Vec<PlannedCircuit>) -> Vec<Vec<PlannedCircuit>>;
}

/// Default strategy: every circuit in one parallel batch.
#[derive(Debug, Default)]
pub struct SingleBatch;

impl BatchStrategy for SingleBatch {
    fn plan(&self, circuits: Vec<PlannedCircuit>) -> Vec<Vec<PlannedCircuit>> {
        if circuits.is_empty() {
            Vec::new()
        } else {
            vec![circuits]
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct CyclePlan {
    pub batches: Vec<Vec<PlannedCircuit>>,
}

impl CyclePlan {
    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(|b| b.is_empty())
    }

    pub fn circuit_count(&self) -> usize {
        self.batches.iter().map(|b| b.len()).sum()
    }

    /// Planned volume for `id`, when the plan includes it.
    pub fn planned_volume(&self, id: u32) -> Option<f64> {
        self.batches
            .iter()
            .flatten()
            .find(|p| p.id == id)
            .map(|p| p.volume)
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

pub struct TaskPlanner {
    strategy: Box<dyn BatchStrategy>,
}

impl TaskPlanner {
    pub fn new(strategy: Box<dyn BatchStrategy>) -> Self {
        Self { strategy }
    }

    pub fn single_batch() -> Self {
        Self::new(Box::new(SingleBatch))
    }

    /// Select the circuits due today, record decisions (including skips),
    /// enqueue the runnable ones, and build the batch list.
    pub async fn plan_cycle(
        &self,
        circuits: &BTreeMap<u32, Arc<Circuit>>,
        store: &StateStore,
        provider: &dyn ConditionsProvider,
        config: &NodeConfig,
        now: DateTime<Utc>,
    ) -> Result<CyclePlan, StateError> {
        let conditions = provider.recent(config.max_interval_days()).await;
        let mut planned: Vec<PlannedCircuit> = Vec::new();

        for (&id, circuit) in circuits {
            if !circuit.is_enabled() {
                debug!(zone = id, "skipping disabled circuit");
                continue;
            }

            let snapshot = store.snapshot(id).await?;
            if !interval_elapsed(snapshot.last_irrigation, circuit.config().interval_days, now) {
                debug!(
                    zone = id,
                    last_irrigation = ?snapshot.last_irrigation,
                    interval_days = circuit.config().interval_days,
                    "interval not elapsed, not due"
                );
                continue;
            }

            let estimate = circuit.estimate(&conditions, config);
            store.record_decision(id).await?;

            if estimate.skip {
                info!(
                    zone = id,
                    adjusted = estimate.adjusted_volume,
                    "weather model skipped irrigation"
                );
                // A circuit mid-manual-run cannot take the skip decision;
                // leave it alone and let the next cycle re-evaluate.
                match store.transition(id, CircuitEvent::SkipDecision).await {
                    Ok(_) => {
                        store
                            .record_result(id, &IrrigationResult::skipped(id, now))
                            .await?;
                    }
                    Err(StateError::IllegalTransition { .. }) => {
                        warn!(zone = id, "circuit busy, skip decision not recorded");
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            match store.transition(id, CircuitEvent::Scheduled).await {
                Ok(_) => planned.push(PlannedCircuit {
                    id,
                    volume: estimate.final_volume,
                }),
                Err(StateError::IllegalTransition { .. }) => {
                    warn!(zone = id, "circuit busy, excluded from plan");
                }
                Err(e) => return Err(e),
            }
        }

        let plan = CyclePlan {
            batches: self.strategy.plan(planned),
        };
        info!(
            circuits = plan.circuit_count(),
            batches = plan.batches.len(),
            "irrigation cycle planned"
        );
        Ok(plan)
    }
}

/// Due check: whole days between the calendar dates, ignoring time of day.
fn interval_elapsed(
    last_irrigation: Option<DateTime<Utc>>,
    interval_days: u32,
    now: DateTime<Utc>,
) -> bool {
    match last_irrigation {
        None => true,
        Some(last) => {
            let elapsed = (now.date_naive() - last.date_naive()).num_days();
            elapsed >= interval_days as i64
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
