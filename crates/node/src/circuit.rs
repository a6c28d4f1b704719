//! One irrigation circuit: owns its relay valve, derives volume and duration
//! targets from the emitter inventory, and drives a timed run with live
//! progress reporting and cooperative cancellation.
//!
//! A run has three phases. Prepare computes the targets (and may decide to
//! skip, in auto mode). Execute opens the valve once and sleeps in steps of
//! at most one second, which bounds how late a stop request is observed.
//! Finalize always closes the valve, with bounded retries; a close failure
//! flags the circuit as faulty and the run as failed.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::conditions::ConditionsSnapshot;
use crate::config::{CircuitConfig, NodeConfig};
use crate::error::CommandError;
use crate::relay::{RelayValve, ValveState};
use crate::types::{round3, IrrigationResult, RuntimeStatus};
use crate::weather::{VolumeEstimate, VolumeModel};

/// Cancellation granularity: the execute loop never sleeps longer than this.
const STEP: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Run modes & preparation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunMode {
    Auto,
    Manual { liters: f64 },
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual { .. } => write!(f, "manual"),
        }
    }
}

/// Targets for a run that will actually open the valve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreparedRun {
    pub mode: RunMode,
    pub target_volume: f64,
    pub target_duration: u64,
}

/// Outcome of the prepare phase.
#[derive(Debug, Clone, PartialEq)]
pub enum Preparation {
    Run(PreparedRun),
    /// The weather model decided against irrigating.
    Skip(VolumeEstimate),
}

// ---------------------------------------------------------------------------
// Circuit
// ---------------------------------------------------------------------------

pub struct Circuit {
    cfg: CircuitConfig,
    valve: tokio::sync::Mutex<RelayValve>,
    runtime: Mutex<Option<RuntimeStatus>>,
    fault: Mutex<Option<String>>,
    model: std::sync::Arc<dyn VolumeModel>,
}

impl Circuit {
    pub fn new(cfg: CircuitConfig, model: std::sync::Arc<dyn VolumeModel>) -> anyhow::Result<Self> {
        let valve = RelayValve::new(cfg.relay_pin)?;
        Ok(Self {
            cfg,
            valve: tokio::sync::Mutex::new(valve),
            runtime: Mutex::new(None),
            fault: Mutex::new(None),
            model,
        })
    }

    pub fn id(&self) -> u32 {
        self.cfg.id
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn is_enabled(&self) -> bool {
        self.cfg.enabled
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.cfg
    }

    /// Largest manual request accepted, per the configured upper clamp.
    pub fn max_manual_volume(&self, config: &NodeConfig) -> f64 {
        round3(self.cfg.base_volume() * config.limits.max_percent / 100.0)
    }

    /// Seconds needed to deliver `liters` at the effective flow, rounded to
    /// the nearest whole second with ties rounding up.
    pub fn duration_for(&self, liters: f64) -> u64 {
        let flow = self.cfg.flow_lph();
        (3600.0 * liters / flow).round() as u64
    }

    fn volume_at(&self, elapsed_secs: f64, target_volume: f64) -> f64 {
        let delivered = self.cfg.flow_lph() * elapsed_secs / 3600.0;
        round3(delivered.min(target_volume))
    }

    // -----------------------------------------------------------------------
    // Prepare
    // -----------------------------------------------------------------------

    /// Compute the targets for one run. Auto mode consults the weather
    /// model and may skip; manual mode validates the requested liters.
    pub fn prepare(
        &self,
        mode: RunMode,
        conditions: &ConditionsSnapshot,
        config: &NodeConfig,
    ) -> Result<Preparation, CommandError> {
        let target_volume = match mode {
            RunMode::Auto => {
                let estimate = self.estimate(conditions, config);
                if estimate.skip {
                    return Ok(Preparation::Skip(estimate));
                }
                estimate.final_volume
            }
            RunMode::Manual { liters } => {
                let max = self.max_manual_volume(config);
                if liters <= 0.0 || liters > max {
                    return Err(CommandError::InvalidVolume {
                        volume: liters,
                        max,
                    });
                }
                liters
            }
        };

        Ok(Preparation::Run(PreparedRun {
            mode,
            target_volume,
            target_duration: self.duration_for(target_volume),
        }))
    }

    /// Weather-adjusted volume for this circuit under `conditions`.
    pub fn estimate(&self, conditions: &ConditionsSnapshot, config: &NodeConfig) -> VolumeEstimate {
        self.model.compute(
            self.cfg.base_volume(),
            conditions,
            &config.standard_conditions,
            &config.correction_factors,
            &self.cfg.correction,
            &config.limits,
        )
    }

    // -----------------------------------------------------------------------
    // Execute + finalize
    // -----------------------------------------------------------------------

    /// Run one prepared irrigation to completion, cancellation, or fault.
    /// The valve is closed on every exit path.
    pub async fn run(&self, prep: PreparedRun, cancel: CancellationToken) -> IrrigationResult {
        let started_wall = Utc::now();
        let started = tokio::time::Instant::now();
        self.update_runtime(0.0, &prep);

        // Open once. A valve that cannot open fails the run before any
        // water is counted.
        if let Err(e) = self.valve.lock().await.set_state(ValveState::Open).await {
            self.set_fault(format!("valve open failed: {e}"));
            self.clear_runtime();
            return IrrigationResult::failed(
                self.cfg.id,
                started_wall,
                0,
                prep.target_duration,
                0.0,
                prep.target_volume,
                format!("valve open failed: {e}"),
            );
        }

        info!(
            zone = self.cfg.id,
            mode = %prep.mode,
            target_volume = prep.target_volume,
            target_duration = prep.target_duration,
            "irrigation started"
        );

        let mut stopped = false;
        loop {
            let elapsed = started.elapsed().as_secs_f64();
            let remaining = prep.target_duration as f64 - elapsed;
            if remaining <= 0.0 {
                break;
            }

            let step = Duration::from_secs_f64(remaining.min(STEP.as_secs_f64()));
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = cancel.cancelled() => {
                    stopped = true;
                }
            }

            self.update_runtime(started.elapsed().as_secs_f64(), &prep);
            if stopped {
                break;
            }
        }

        let elapsed_secs = started.elapsed().as_secs_f64();

        // Finalize: the close must happen no matter how the loop ended.
        let close_error = self
            .valve
            .lock()
            .await
            .set_state(ValveState::Closed)
            .await
            .err();

        self.clear_runtime();

        let result = if let Some(e) = close_error {
            let reason = format!("valve close failed: {e}");
            self.set_fault(reason.clone());
            warn!(zone = self.cfg.id, "irrigation faulted: {reason}");
            IrrigationResult::failed(
                self.cfg.id,
                started_wall,
                elapsed_secs.round() as u64,
                prep.target_duration,
                self.volume_at(elapsed_secs, prep.target_volume),
                prep.target_volume,
                reason,
            )
        } else if stopped {
            IrrigationResult::stopped(
                self.cfg.id,
                started_wall,
                elapsed_secs.round() as u64,
                prep.target_duration,
                self.volume_at(elapsed_secs, prep.target_volume),
                prep.target_volume,
            )
        } else {
            IrrigationResult::success(
                self.cfg.id,
                started_wall,
                prep.target_duration,
                prep.target_duration,
                prep.target_volume,
            )
        };

        info!(
            zone = self.cfg.id,
            outcome = %result.outcome,
            duration = result.completed_duration,
            volume = result.actual_volume,
            "irrigation finished"
        );
        result
    }

    // -----------------------------------------------------------------------
    // Runtime status & fault flag
    // -----------------------------------------------------------------------

    /// Live progress, present only while a worker is executing this circuit.
    pub fn runtime_status(&self) -> Option<RuntimeStatus> {
        self.runtime.lock().expect("runtime lock").clone()
    }

    pub fn has_fault(&self) -> bool {
        self.fault.lock().expect("fault lock").is_some()
    }

    pub fn fault_reason(&self) -> Option<String> {
        self.fault.lock().expect("fault lock").clone()
    }

    fn set_fault(&self, reason: String) {
        *self.fault.lock().expect("fault lock") = Some(reason);
    }

    fn update_runtime(&self, elapsed_secs: f64, prep: &PreparedRun) {
        let elapsed_secs = elapsed_secs.min(prep.target_duration as f64);
        let progress = if prep.target_duration == 0 {
            100.0
        } else {
            let pct = elapsed_secs / prep.target_duration as f64 * 100.0;
            (pct.min(100.0) * 100.0).round() / 100.0
        };
        *self.runtime.lock().expect("runtime lock") = Some(RuntimeStatus {
            target_volume: prep.target_volume,
            current_volume: self.volume_at(elapsed_secs, prep.target_volume),
            target_duration: prep.target_duration,
            elapsed_secs: elapsed_secs as u64,
            progress_percent: progress,
        });
    }

    fn clear_runtime(&self) {
        *self.runtime.lock().expect("runtime lock") = None;
    }

    // -----------------------------------------------------------------------
    // Shutdown support
    // -----------------------------------------------------------------------

    /// Best-effort close, for shutdown sweeps. Errors are logged only.
    pub async fn force_close(&self) {
        if let Err(e) = self.valve.lock().await.set_state(ValveState::Closed).await {
            warn!(zone = self.cfg.id, "force close failed: {e}");
        }
    }

    pub async fn valve_state(&self) -> ValveState {
        self.valve.lock().await.state()
    }

    /// Make the next `n` relay writes fail. Fault-path testing.
    #[cfg(not(feature = "gpio"))]
    pub async fn inject_valve_failures(&self, n: u32) {
        self.valve.lock().await.inject_failures(n);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
