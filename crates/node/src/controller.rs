//! Controller core: owns the circuits, weather provider, durable store,
//! worker registry, executor, planner, scheduler, and auto service, and
//! derives the global controller state from live worker counts.
//!
//! The derived state is never persisted. ERROR is sticky: executor fatals,
//! stop timeouts, and exhausted persistence retries all land here, and only
//! a process restart leaves it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{Local, Utc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::auto::AutoIrrigationService;
use crate::circuit::Circuit;
use crate::conditions::{
    ConditionsProvider, EcowittConditions, FixedConditions, SimulatedConditions,
};
use crate::config::{Environment, NodeConfig};
use crate::error::{CommandError, WorkerError};
use crate::executor::{ExecutorEvent, IrrigationExecutor, WORKER_STOP_DEADLINE};
use crate::planner::{CyclePlan, TaskPlanner};
use crate::scheduler::TaskScheduler;
use crate::status::{status_message, StatusAggregator};
use crate::store::StateStore;
use crate::types::{ControllerState, ControllerStatus};
use crate::weather::WeatherAdjustedModel;
use crate::workers::{TaskType, WorkerRegistry};

/// Fixed simulator seed keeps development cycles reproducible.
const WEATHER_SIMULATOR_SEED: u64 = 42;

const REFRESH_STATE_INTERVAL: Duration = Duration::from_secs(5);
const AUTO_TICK_INTERVAL: Duration = Duration::from_secs(60);
const CYCLE_WORKER_KEY: &str = "cycle";

type StateListener = Box<dyn Fn(ControllerState) + Send + Sync>;

pub struct Controller {
    config: Arc<NodeConfig>,
    circuits: BTreeMap<u32, Arc<Circuit>>,
    provider: Arc<dyn ConditionsProvider>,
    store: Arc<StateStore>,
    registry: WorkerRegistry,
    executor: Arc<IrrigationExecutor>,
    planner: TaskPlanner,
    scheduler: TaskScheduler,
    auto: AutoIrrigationService,
    aggregator: StatusAggregator,

    state: Mutex<ControllerState>,
    error_flag: AtomicBool,
    current_plan: Mutex<Option<CyclePlan>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ExecutorEvent>>>,
    state_listeners: Mutex<Vec<StateListener>>,
}

impl Controller {
    /// Build a controller with the provider selected by configuration:
    /// the simulator outside production when requested, the weather API
    /// when enabled, standard conditions otherwise.
    pub async fn new(
        config: NodeConfig,
        state_path: impl Into<std::path::PathBuf>,
        log_path: impl Into<std::path::PathBuf>,
    ) -> anyhow::Result<Arc<Self>> {
        let provider = select_provider(&config);
        Self::with_provider(config, state_path, log_path, provider).await
    }

    pub async fn with_provider(
        config: NodeConfig,
        state_path: impl Into<std::path::PathBuf>,
        log_path: impl Into<std::path::PathBuf>,
        provider: Arc<dyn ConditionsProvider>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate().context("invalid configuration")?;
        let config = Arc::new(config);

        let store = Arc::new(
            StateStore::open(state_path, log_path, &config.circuits)
                .await
                .context("failed to initialise circuit state")?,
        );

        let model = Arc::new(WeatherAdjustedModel);
        let mut circuits: BTreeMap<u32, Arc<Circuit>> = BTreeMap::new();
        for cfg in &config.circuits {
            let circuit = Circuit::new(cfg.clone(), model.clone())
                .with_context(|| format!("failed to initialise circuit {}", cfg.id))?;
            circuits.insert(cfg.id, Arc::new(circuit));
        }

        let registry = WorkerRegistry::new();
        let (executor, events_rx) = IrrigationExecutor::new(
            circuits.clone(),
            Arc::clone(&store),
            registry.clone(),
            Arc::clone(&config),
            Arc::clone(&provider),
        );

        let controller = Arc::new(Self {
            scheduler: TaskScheduler::new(registry.clone()),
            auto: AutoIrrigationService::new(&config.automation),
            aggregator: StatusAggregator::new(circuits.clone(), Arc::clone(&store)),
            planner: TaskPlanner::single_batch(),
            circuits,
            provider,
            store,
            registry,
            executor,
            config,
            state: Mutex::new(ControllerState::Idle),
            error_flag: AtomicBool::new(false),
            current_plan: Mutex::new(None),
            events_rx: Mutex::new(Some(events_rx)),
            state_listeners: Mutex::new(Vec::new()),
        });

        info!(
            circuits = controller.circuits.len(),
            "controller initialised"
        );
        Ok(controller)
    }

    /// Start the event dispatcher and the background scheduler tasks.
    pub fn start(self: &Arc<Self>) -> Result<(), WorkerError> {
        let Some(mut rx) = self.events_rx.lock().expect("events lock").take() else {
            return Err(WorkerError::AlreadyExists {
                task: TaskType::Executor,
                key: "event-dispatcher".to_string(),
            });
        };

        // Single consumer: executor callbacks arrive in one total order.
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(controller) = weak.upgrade() else { break };
                match event {
                    ExecutorEvent::Fatal { reason } => controller.enter_error(&reason),
                    ExecutorEvent::Started { .. } | ExecutorEvent::Finished { .. } => {
                        controller.refresh_state();
                    }
                }
            }
        });

        let weak = Arc::downgrade(self);
        self.scheduler
            .register("refresh_state", REFRESH_STATE_INTERVAL, move || {
                let weak = weak.clone();
                async move {
                    if let Some(controller) = weak.upgrade() {
                        controller.refresh_state();
                    }
                }
            })?;

        let provider = Arc::clone(&self.provider);
        self.scheduler.register(
            "weather_cache_refresh",
            Duration::from_secs(self.config.weather_api.cache_ttl_secs),
            move || {
                let provider = Arc::clone(&provider);
                async move { provider.refresh().await }
            },
        )?;

        let weak = Arc::downgrade(self);
        self.scheduler
            .register("auto_irrigation_tick", AUTO_TICK_INTERVAL, move || {
                let weak = weak.clone();
                async move {
                    if let Some(controller) = weak.upgrade() {
                        controller.auto_tick().await;
                    }
                }
            })?;

        self.scheduler.start()?;
        info!("controller started");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound commands
    // -----------------------------------------------------------------------

    /// Plan today's circuits and dispatch the cycle to the executor.
    pub async fn start_auto_cycle(&self) -> Result<(), CommandError> {
        if self.controller_state() == ControllerState::Error {
            warn!("auto cycle refused: controller is in error state");
            return Err(CommandError::Faulted);
        }
        if self.registry.is_registered(TaskType::Executor, CYCLE_WORKER_KEY) {
            return Err(CommandError::Worker(WorkerError::AlreadyExists {
                task: TaskType::Executor,
                key: CYCLE_WORKER_KEY.to_string(),
            }));
        }

        let plan = self
            .planner
            .plan_cycle(
                &self.circuits,
                &self.store,
                self.provider.as_ref(),
                &self.config,
                Utc::now(),
            )
            .await?;

        *self.current_plan.lock().expect("plan lock") = Some(plan.clone());
        if plan.is_empty() {
            info!("auto cycle: nothing due today");
            return Ok(());
        }

        let executor = Arc::clone(&self.executor);
        let cycle = plan.clone();
        let spawned = self.registry.spawn(
            TaskType::Executor,
            CYCLE_WORKER_KEY,
            tokio_util::sync::CancellationToken::new(),
            async move {
                executor.run_cycle(cycle).await;
            },
        );
        if let Err(e) = spawned {
            // Queue slots were taken during planning; free them again.
            self.executor
                .release_plan(&plan, "cycle dispatch failed")
                .await;
            return Err(e.into());
        }

        self.refresh_state();
        Ok(())
    }

    /// Dispatch one manual run. Returns as soon as the worker is spawned.
    pub async fn manual_irrigate(&self, circuit_id: u32, liters: f64) -> Result<(), CommandError> {
        if self.controller_state() == ControllerState::Error {
            warn!(zone = circuit_id, "manual irrigation refused: error state");
            return Err(CommandError::Faulted);
        }
        let circuit = self
            .circuits
            .get(&circuit_id)
            .ok_or(CommandError::UnknownCircuit(circuit_id))?;
        if !circuit.is_enabled() {
            return Err(CommandError::CircuitDisabled(circuit_id));
        }
        let max = circuit.max_manual_volume(&self.config);
        if liters <= 0.0 || liters > max {
            return Err(CommandError::InvalidVolume {
                volume: liters,
                max,
            });
        }

        self.executor.run_manual(circuit_id, liters)?;
        self.refresh_state();
        Ok(())
    }

    /// Stop every active irrigation with a bounded join.
    pub async fn stop_all(&self) -> Result<(), CommandError> {
        let result = self.executor.stop_all().await;
        self.refresh_state();
        result.map_err(CommandError::Worker)
    }

    /// Periodic check of the automatic schedule. Fires the daily cycle at
    /// most once per scheduled window.
    async fn auto_tick(&self) {
        let now = Local::now();
        if !self.auto.should_fire(now) {
            return;
        }
        // Latch before dispatch so a failed start does not retrigger every
        // tick of the same window.
        self.auto.mark_fired(now);
        info!("scheduled irrigation window reached, starting auto cycle");
        if let Err(e) = self.start_auto_cycle().await {
            warn!("auto cycle did not start: {e}");
        }
    }

    pub fn pause_auto(&self) {
        self.auto.pause();
        info!("automatic irrigation paused");
    }

    pub fn resume_auto(&self) {
        self.auto.resume();
        info!("automatic irrigation resumed");
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn controller_state(&self) -> ControllerState {
        *self.state.lock().expect("state lock")
    }

    /// Handle to one circuit (fault flag, runtime status, valve state).
    pub fn circuit(&self, circuit_id: u32) -> Option<Arc<Circuit>> {
        self.circuits.get(&circuit_id).cloned()
    }

    /// Whether an auto cycle is currently being executed.
    pub fn is_cycle_running(&self) -> bool {
        self.registry
            .is_registered(TaskType::Executor, CYCLE_WORKER_KEY)
    }

    pub async fn status(&self) -> Result<ControllerStatus, CommandError> {
        let plan = self.current_plan.lock().expect("plan lock").clone();
        let zones = self.aggregator.all_statuses(plan.as_ref()).await?;
        Ok(ControllerStatus {
            controller_state: self.controller_state(),
            auto_enabled: self.auto.is_enabled(),
            auto_paused: self.auto.is_paused(),
            zones,
        })
    }

    /// Legacy single-line status for the central server.
    pub async fn status_line(&self) -> Result<String, CommandError> {
        Ok(status_message(&self.status().await?))
    }

    /// Observe derived-state changes (bridges publish these).
    pub fn on_state_changed(&self, listener: impl Fn(ControllerState) + Send + Sync + 'static) {
        self.state_listeners
            .lock()
            .expect("listeners lock")
            .push(Box::new(listener));
    }

    // -----------------------------------------------------------------------
    // Derived state
    // -----------------------------------------------------------------------

    /// Re-derive the controller state from worker counts and flags. The
    /// state mutex serializes concurrent refreshes.
    pub fn refresh_state(&self) -> ControllerState {
        let derived = if self.error_flag.load(Ordering::SeqCst) {
            ControllerState::Error
        } else {
            let active = self.registry.active_count(TaskType::Irrigation);
            if active > 0 {
                if self.executor.is_stopping() {
                    ControllerState::Stopping
                } else {
                    ControllerState::Irrigating
                }
            } else {
                ControllerState::Idle
            }
        };

        let mut state = self.state.lock().expect("state lock");
        if *state != derived {
            let previous = *state;
            *state = derived;
            drop(state);
            info!(from = %previous, to = %derived, "controller state changed");
            for listener in self.state_listeners.lock().expect("listeners lock").iter() {
                listener(derived);
            }
        }
        derived
    }

    fn enter_error(&self, reason: &str) {
        error!("controller entering error state: {reason}");
        self.error_flag.store(true, Ordering::SeqCst);
        self.refresh_state();
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Clean shutdown: stop background tasks, stop workers with deadlines,
    /// force every relay closed, and mark the durable state.
    pub async fn shutdown(&self) {
        info!("controller shutting down");

        if let Err(e) = self.scheduler.stop().await {
            warn!("scheduler did not stop cleanly: {e}");
        }
        if let Err(e) = self.executor.stop_all().await {
            warn!("irrigation workers did not stop cleanly: {e}");
        }
        if let Err(e) = self
            .registry
            .join_all(TaskType::Executor, Some(WORKER_STOP_DEADLINE))
            .await
        {
            warn!("cycle worker did not finish cleanly: {e}");
        }

        // Belt and braces: no relay stays energized past this point.
        for circuit in self.circuits.values() {
            circuit.force_close().await;
        }

        if let Err(e) = self.store.shutdown().await {
            warn!("failed to mark clean shutdown: {e}");
        }
        info!("controller shutdown complete");
    }
}

fn select_provider(config: &NodeConfig) -> Arc<dyn ConditionsProvider> {
    let automation = &config.automation;
    if automation.use_weather_simulator && automation.environment != Environment::Production {
        info!(seed = WEATHER_SIMULATOR_SEED, "using weather simulator");
        Arc::new(SimulatedConditions::new(WEATHER_SIMULATOR_SEED))
    } else if config.weather_api.enabled {
        info!("using weather API provider");
        Arc::new(EcowittConditions::new(
            config.weather_api.clone(),
            config.standard_conditions,
        ))
    } else {
        warn!("weather API disabled, operating on standard conditions");
        Arc::new(FixedConditions::standard(&config.standard_conditions))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
