//! Durable circuit state: `zones_state.json` snapshots plus the append-only
//! `irrigation_log.json`. All mutations run under one mutex; disk writes are
//! atomic (temp file + rename) and retried with exponential backoff before
//! surfacing a persistence error.
//!
//! Crash recovery happens at open: a snapshot still marked `irrigating`
//! means the previous process died mid-run, so the circuit is released with
//! an `interrupted` outcome and a matching log record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::CircuitConfig;
use crate::error::StateError;
use crate::types::{
    next_state, CircuitEvent, CircuitSnapshot, CircuitState, IrrigationResult, Outcome,
    ZonesStateFile,
};

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct StateStore {
    state_path: PathBuf,
    log_path: PathBuf,
    inner: Mutex<BTreeMap<u32, CircuitSnapshot>>,
}

impl StateStore {
    /// Load (or rebuild) the state file, reconcile it against the configured
    /// circuits, and run unclean-shutdown recovery.
    pub async fn open(
        state_path: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
        configs: &[CircuitConfig],
    ) -> Result<Self, StateError> {
        let store = Self {
            state_path: state_path.into(),
            log_path: log_path.into(),
            inner: Mutex::new(BTreeMap::new()),
        };

        let loaded = load_state_file(&store.state_path).await;
        let mut snapshots: BTreeMap<u32, CircuitSnapshot> =
            loaded.into_iter().map(|s| (s.id, s)).collect();

        // Snapshots for circuits that vanished from the config are dropped.
        let configured: std::collections::HashSet<u32> = configs.iter().map(|c| c.id).collect();
        snapshots.retain(|&id, _| {
            let keep = configured.contains(&id);
            if !keep {
                warn!(circuit = id, "dropping snapshot for unconfigured circuit");
            }
            keep
        });

        let mut interrupted: Vec<IrrigationResult> = Vec::new();
        let now = Utc::now();

        for cfg in configs {
            let snap = snapshots
                .entry(cfg.id)
                .or_insert_with(|| CircuitSnapshot::fresh(cfg.id, cfg.enabled));

            match snap.circuit_state {
                CircuitState::Irrigating => {
                    warn!(
                        circuit = cfg.id,
                        "unclean shutdown detected, marking irrigation interrupted"
                    );
                    snap.last_outcome = Some(Outcome::Interrupted);
                    snap.last_irrigation = Some(now);
                    snap.last_duration = 0;
                    snap.last_volume = 0.0;
                    snap.last_decision = Some(now);
                    interrupted.push(IrrigationResult::interrupted(cfg.id, now));
                }
                CircuitState::Waiting => {
                    debug!(circuit = cfg.id, "releasing circuit left waiting");
                }
                _ => {}
            }

            // DISABLED tracks the config's enabled flag, everything else
            // settles back to IDLE for the new process.
            snap.circuit_state = if cfg.enabled {
                CircuitState::Idle
            } else {
                CircuitState::Disabled
            };
        }

        {
            let mut guard = store.inner.lock().await;
            *guard = snapshots;
            store.persist_locked(&guard).await?;
        }
        for record in &interrupted {
            store.append_log(record).await?;
        }

        info!(
            circuits = configs.len(),
            recovered = interrupted.len(),
            "circuit state initialised"
        );
        Ok(store)
    }

    pub async fn snapshot(&self, circuit_id: u32) -> Result<CircuitSnapshot, StateError> {
        self.inner
            .lock()
            .await
            .get(&circuit_id)
            .cloned()
            .ok_or(StateError::UnknownCircuit(circuit_id))
    }

    pub async fn all_snapshots(&self) -> Vec<CircuitSnapshot> {
        self.inner.lock().await.values().cloned().collect()
    }

    /// Apply one state-machine event. Illegal transitions are rejected
    /// without mutating anything.
    pub async fn transition(
        &self,
        circuit_id: u32,
        event: CircuitEvent,
    ) -> Result<CircuitState, StateError> {
        let mut inner = self.inner.lock().await;
        let snap = inner
            .get_mut(&circuit_id)
            .ok_or(StateError::UnknownCircuit(circuit_id))?;

        let from = snap.circuit_state;
        let Some(to) = next_state(from, event) else {
            let err = StateError::IllegalTransition {
                circuit_id,
                from,
                event,
            };
            error!(circuit = circuit_id, %from, %event, "rejected illegal transition");
            return Err(err);
        };

        snap.circuit_state = to;
        debug!(circuit = circuit_id, %from, %to, %event, "circuit transition");
        self.persist_locked(&inner).await?;
        Ok(to)
    }

    /// Stamp the planner's decision time.
    pub async fn record_decision(&self, circuit_id: u32) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        let snap = inner
            .get_mut(&circuit_id)
            .ok_or(StateError::UnknownCircuit(circuit_id))?;
        snap.last_decision = Some(Utc::now());
        self.persist_locked(&inner).await
    }

    /// Record the outcome of one irrigation attempt and append it to the
    /// log. A skipped attempt keeps the previous real-irrigation metrics.
    pub async fn record_result(
        &self,
        circuit_id: u32,
        result: &IrrigationResult,
    ) -> Result<(), StateError> {
        {
            let mut inner = self.inner.lock().await;
            let snap = inner
                .get_mut(&circuit_id)
                .ok_or(StateError::UnknownCircuit(circuit_id))?;

            snap.last_outcome = Some(result.outcome);
            if result.outcome != Outcome::Skipped {
                snap.last_irrigation = Some(result.start_time);
                snap.last_duration = result.completed_duration;
                snap.last_volume = result.actual_volume;
            }
            self.persist_locked(&inner).await?;
        }
        self.append_log(result).await
    }

    /// Mark circuits still enqueued or running as cleanly shut down.
    pub async fn shutdown(&self) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        for snap in inner.values_mut() {
            if matches!(
                snap.circuit_state,
                CircuitState::Irrigating | CircuitState::Waiting
            ) {
                snap.circuit_state = CircuitState::Shutdown;
            }
        }
        self.persist_locked(&inner).await
    }

    /// Full contents of the irrigation log, oldest first.
    pub async fn log_entries(&self) -> Result<Vec<IrrigationResult>, StateError> {
        Ok(load_log_file(&self.log_path).await)
    }

    // -----------------------------------------------------------------------
    // Persistence internals
    // -----------------------------------------------------------------------

    async fn persist_locked(
        &self,
        snapshots: &BTreeMap<u32, CircuitSnapshot>,
    ) -> Result<(), StateError> {
        let file = ZonesStateFile {
            last_updated: Utc::now(),
            circuits: snapshots.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file).expect("state serializes");
        persist_with_retry(&self.state_path, &bytes).await
    }

    async fn append_log(&self, record: &IrrigationResult) -> Result<(), StateError> {
        let mut entries = load_log_file(&self.log_path).await;
        entries.push(record.clone());
        let bytes = serde_json::to_vec_pretty(&entries).expect("log serializes");
        persist_with_retry(&self.log_path, &bytes).await
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

async fn load_state_file(path: &Path) -> Vec<CircuitSnapshot> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => {
            warn!(path = %path.display(), "state file is empty, rebuilding from config");
            Vec::new()
        }
        Ok(bytes) => match serde_json::from_slice::<ZonesStateFile>(&bytes) {
            Ok(file) => file.circuits,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    "state file is corrupt ({e}), rebuilding from config"
                );
                Vec::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), "failed to read state file ({e}), rebuilding");
            Vec::new()
        }
    }
}

async fn load_log_file(path: &Path) -> Vec<IrrigationResult> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Vec::new(),
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), "irrigation log is corrupt ({e}), starting fresh");
                Vec::new()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), "failed to read irrigation log ({e})");
            Vec::new()
        }
    }
}

/// Write-temp-then-rename so readers never observe a half-written file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

async fn persist_with_retry(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let mut delay = PERSIST_BACKOFF;
    let mut last_err: Option<std::io::Error> = None;

    for attempt in 1..=PERSIST_ATTEMPTS {
        match write_atomic(path, bytes).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(path = %path.display(), attempt, "persist failed: {e}");
                last_err = Some(e);
                if attempt < PERSIST_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    Err(StateError::Persistence {
        path: path.to_path_buf(),
        source: last_err.expect("at least one attempt failed"),
    })
}

// ===========================================================================
// Tests
// ===========================================================================
