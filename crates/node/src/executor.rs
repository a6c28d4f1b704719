//! Irrigation execution: runs planned batches sequentially, one worker per
//! circuit within a batch, under a shared stop token. Lifecycle events flow
//! through a single mpsc channel, so the consumer observes starts and
//! finishes in one total order.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::circuit::{Circuit, Preparation, RunMode};
use crate::conditions::{ConditionsProvider, ConditionsSnapshot};
use crate::config::NodeConfig;
use crate::error::{CommandError, StateError, WorkerError};
use crate::planner::CyclePlan;
use crate::store::StateStore;
use crate::types::{CircuitEvent, CircuitState, IrrigationResult, Outcome};
use crate::workers::{TaskType, WorkerRegistry};

/// Whole-fleet stop budget.
pub const STOP_ALL_DEADLINE: Duration = Duration::from_secs(30);
/// Budget for a single worker after its token is cancelled.
pub const WORKER_STOP_DEADLINE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Lifecycle events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    Started {
        circuit_id: u32,
    },
    Finished {
        circuit_id: u32,
        result: IrrigationResult,
    },
    /// Unrecoverable condition; the controller goes to ERROR.
    Fatal {
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct IrrigationExecutor {
    circuits: BTreeMap<u32, Arc<Circuit>>,
    store: Arc<StateStore>,
    registry: WorkerRegistry,
    config: Arc<NodeConfig>,
    provider: Arc<dyn ConditionsProvider>,
    /// Current stop token. Replaced after a completed stop and at cycle
    /// start, so a past stop does not poison the next cycle.
    stop: Mutex<CancellationToken>,
    events: mpsc::UnboundedSender<ExecutorEvent>,
}

impl IrrigationExecutor {
    pub fn new(
        circuits: BTreeMap<u32, Arc<Circuit>>,
        store: Arc<StateStore>,
        registry: WorkerRegistry,
        config: Arc<NodeConfig>,
        provider: Arc<dyn ConditionsProvider>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ExecutorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                circuits,
                store,
                registry,
                config,
                provider,
                stop: Mutex::new(CancellationToken::new()),
                events,
            }),
            rx,
        )
    }

    /// Whether a stop has been requested and not yet fully processed.
    pub fn is_stopping(&self) -> bool {
        self.stop.lock().expect("stop lock").is_cancelled()
    }

    fn stop_token(&self) -> CancellationToken {
        self.stop.lock().expect("stop lock").clone()
    }

    fn reset_stop(&self) {
        *self.stop.lock().expect("stop lock") = CancellationToken::new();
    }

    fn emit(&self, event: ExecutorEvent) {
        // The receiver only disappears at shutdown.
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Cycle execution
    // -----------------------------------------------------------------------

    /// Execute a planned cycle. Batches run sequentially; the next batch
    /// starts only after every irrigation worker (manual runs included) has
    /// been joined.
    pub async fn run_cycle(&self, plan: CyclePlan) {
        // The cycle observes the token that was live when it started; a
        // stop_all during the cycle cancels exactly this token, even though
        // the registry-level token is replaced once the stop completes.
        let stop = self.stop_token();

        let total_batches = plan.batches.len();
        for (index, batch) in plan.batches.iter().enumerate() {
            if stop.is_cancelled() {
                self.release_plan(&plan, "cycle stopped before start").await;
                break;
            }

            info!(
                batch = index + 1,
                total_batches,
                circuits = batch.len(),
                "starting irrigation batch"
            );

            for planned in batch {
                if let Err(e) = self.spawn_worker(planned.id, RunMode::Auto) {
                    warn!(zone = planned.id, "worker not started: {e}");
                    self.release_circuit(planned.id, &format!("worker not started: {e}"))
                        .await;
                }
            }

            // No deadline here: a healthy batch takes as long as its
            // longest irrigation.
            let _ = self.registry.join_all(TaskType::Irrigation, None).await;
        }
        info!("irrigation cycle finished");
    }

    /// Dispatch one manual run as a single-element batch.
    pub fn run_manual(&self, circuit_id: u32, liters: f64) -> Result<(), CommandError> {
        if !self.circuits.contains_key(&circuit_id) {
            return Err(CommandError::UnknownCircuit(circuit_id));
        }
        self.spawn_worker(circuit_id, RunMode::Manual { liters })
    }

    /// Signal every irrigation worker and wait for bounded join. A missed
    /// deadline is fatal: relays may still be energized.
    pub async fn stop_all(&self) -> Result<(), WorkerError> {
        info!(
            active = self.registry.active_count(TaskType::Irrigation),
            "stopping all irrigation"
        );
        self.stop_token().cancel();

        match self
            .registry
            .join_all(TaskType::Irrigation, Some(STOP_ALL_DEADLINE))
            .await
        {
            Ok(()) => {
                self.reset_stop();
                info!("all irrigation workers stopped");
                Ok(())
            }
            Err(e) => {
                error!("irrigation workers failed to stop: {e}");
                self.emit(ExecutorEvent::Fatal {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Worker plumbing
    // -----------------------------------------------------------------------

    fn spawn_worker(&self, circuit_id: u32, mode: RunMode) -> Result<(), CommandError> {
        let circuit = self
            .circuits
            .get(&circuit_id)
            .ok_or(CommandError::UnknownCircuit(circuit_id))?
            .clone();

        let cancel = self.stop_token().child_token();
        let worker_cancel = cancel.clone();
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);
        let provider = Arc::clone(&self.provider);
        let events = self.events.clone();

        self.registry.spawn(
            TaskType::Irrigation,
            &circuit_id.to_string(),
            cancel,
            async move {
                circuit_worker(
                    circuit,
                    mode,
                    store,
                    config,
                    provider,
                    events,
                    worker_cancel,
                )
                .await;
            },
        )?;
        Ok(())
    }

    /// Release every circuit still enqueued in `plan` (stop path, or a
    /// plan whose dispatch failed).
    pub async fn release_plan(&self, plan: &CyclePlan, reason: &str) {
        for planned in plan.batches.iter().flatten() {
            self.release_circuit(planned.id, reason).await;
        }
    }

    /// If `circuit_id` is still WAITING, move it back to IDLE with a failed
    /// result, per the cancel-or-timeout edge.
    async fn release_circuit(&self, circuit_id: u32, reason: &str) {
        let waiting = matches!(
            self.store.snapshot(circuit_id).await,
            Ok(snap) if snap.circuit_state == CircuitState::Waiting
        );
        if !waiting {
            return;
        }

        if let Err(e) = self.store.transition(circuit_id, CircuitEvent::Cancel).await {
            error!(zone = circuit_id, "failed to release enqueued circuit: {e}");
            return;
        }
        let result = IrrigationResult::failed(
            circuit_id,
            chrono::Utc::now(),
            0,
            0,
            0.0,
            0.0,
            reason,
        );
        if let Err(e) = self.store.record_result(circuit_id, &result).await {
            self.report_state_error(e);
        }
        self.emit(ExecutorEvent::Finished { circuit_id, result });
    }

    fn report_state_error(&self, e: StateError) {
        if matches!(e, StateError::Persistence { .. }) {
            self.emit(ExecutorEvent::Fatal {
                reason: e.to_string(),
            });
        } else {
            error!("state error: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Per-circuit worker
// ---------------------------------------------------------------------------

async fn circuit_worker(
    circuit: Arc<Circuit>,
    mode: RunMode,
    store: Arc<StateStore>,
    config: Arc<NodeConfig>,
    provider: Arc<dyn ConditionsProvider>,
    events: mpsc::UnboundedSender<ExecutorEvent>,
    cancel: CancellationToken,
) {
    let circuit_id = circuit.id();
    let emit = |event: ExecutorEvent| {
        let _ = events.send(event);
    };
    let fatal_if_persistence = |e: &StateError| {
        if matches!(e, StateError::Persistence { .. }) {
            let _ = events.send(ExecutorEvent::Fatal {
                reason: e.to_string(),
            });
        }
    };

    // Auto mode re-derives its target from the freshest cached weather;
    // manual mode only needs the configured reference.
    let conditions = match mode {
        RunMode::Auto => provider.recent(config.max_interval_days()).await,
        RunMode::Manual { .. } => ConditionsSnapshot::standard(&config.standard_conditions),
    };

    let preparation = match circuit.prepare(mode, &conditions, &config) {
        Ok(p) => p,
        Err(e) => {
            // Manual requests are validated before dispatch, so this is a
            // race (limits changed) rather than the normal rejection path.
            warn!(zone = circuit_id, "irrigation request rejected: {e}");
            let result = IrrigationResult::failed(
                circuit_id,
                chrono::Utc::now(),
                0,
                0,
                0.0,
                0.0,
                e.to_string(),
            );
            release_if_waiting(&store, circuit_id, &result, &fatal_if_persistence).await;
            emit(ExecutorEvent::Finished { circuit_id, result });
            return;
        }
    };

    let prep = match preparation {
        Preparation::Run(prep) => prep,
        Preparation::Skip(estimate) => {
            // Weather drifted between planning and execution. The valve is
            // never opened; the circuit leaves its queue slot with a
            // skipped record.
            info!(
                zone = circuit_id,
                adjusted = estimate.adjusted_volume,
                "conditions changed since planning, skipping"
            );
            let skipped = IrrigationResult::skipped(circuit_id, chrono::Utc::now());
            if let Err(e) = store.transition(circuit_id, CircuitEvent::Cancel).await {
                fatal_if_persistence(&e);
            } else if let Err(e) = store.record_result(circuit_id, &skipped).await {
                fatal_if_persistence(&e);
            }
            emit(ExecutorEvent::Finished {
                circuit_id,
                result: skipped,
            });
            return;
        }
    };

    // WAITING → IRRIGATING for planned runs, IDLE → IRRIGATING for manual.
    if let Err(e) = store.transition(circuit_id, CircuitEvent::Start).await {
        error!(zone = circuit_id, "cannot start irrigation: {e}");
        fatal_if_persistence(&e);
        return;
    }
    emit(ExecutorEvent::Started { circuit_id });

    let result = circuit.run(prep, cancel).await;

    if let Err(e) = store.record_result(circuit_id, &result).await {
        fatal_if_persistence(&e);
    }
    let event = match result.outcome {
        Outcome::Success => CircuitEvent::Complete,
        Outcome::Stopped => CircuitEvent::Stop,
        _ => CircuitEvent::Fault,
    };
    if let Err(e) = store.transition(circuit_id, event).await {
        fatal_if_persistence(&e);
    }

    emit(ExecutorEvent::Finished { circuit_id, result });
}

async fn release_if_waiting(
    store: &StateStore,
    circuit_id: u32,
    result: &IrrigationResult,
    fatal_if_persistence: &impl Fn(&StateError),
) {
    let waiting = matches!(
        store.snapshot(circuit_id).await,
        Ok(snap) if snap.circuit_state == CircuitState::Waiting
    );
    if !waiting {
        return;
    }
    if let Err(e) = store.transition(circuit_id, CircuitEvent::Cancel).await {
        fatal_if_persistence(&e);
        return;
    }
    if let Err(e) = store.record_result(circuit_id, result).await {
        fatal_if_persistence(&e);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
