//! Typed worker registry. Enforces one worker per (task type, key) pair,
//! deregisters on any exit path (including panics, via a drop guard), and
//! offers bounded stop/join built on cancellation tokens.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::WorkerError;

/// How often bounded waits re-check the registry.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Task types & keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Irrigation,
    Executor,
    Scheduler,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Irrigation => "irrigation",
            Self::Executor => "executor",
            Self::Scheduler => "scheduler",
        };
        write!(f, "{s}")
    }
}

type WorkerKey = (TaskType, String);

struct WorkerEntry {
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<Mutex<HashMap<WorkerKey, WorkerEntry>>>,
}

/// Removes the registry entry when the worker ends, however it ends.
struct Deregister {
    workers: Arc<Mutex<HashMap<WorkerKey, WorkerEntry>>>,
    key: WorkerKey,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.workers
            .lock()
            .expect("worker registry lock")
            .remove(&self.key);
        debug!(task = %self.key.0, key = %self.key.1, "worker deregistered");
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a worker under `(task, key)`. Fails without spawning when a
    /// worker is already registered under that pair.
    ///
    /// The worker future is expected to observe `cancel`; the token is kept
    /// in the registry so `stop` can signal it.
    pub fn spawn<F>(
        &self,
        task: TaskType,
        key: &str,
        cancel: CancellationToken,
        fut: F,
    ) -> Result<(), WorkerError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let worker_key: WorkerKey = (task, key.to_string());
        {
            let mut map = self.workers.lock().expect("worker registry lock");
            if map.contains_key(&worker_key) {
                return Err(WorkerError::AlreadyExists {
                    task,
                    key: key.to_string(),
                });
            }
            map.insert(worker_key.clone(), WorkerEntry { cancel });
        }

        debug!(task = %task, key = %key, "worker started");
        let guard = Deregister {
            workers: Arc::clone(&self.workers),
            key: worker_key,
        };
        tokio::spawn(async move {
            let _guard = guard;
            // An inner task isolates panics so they can be reported rather
            // than silently killing the wrapper.
            match tokio::spawn(fut).await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    error!(task = %task, "worker panicked: {e}");
                }
                Err(_) => {} // cancelled at shutdown
            }
        });
        Ok(())
    }

    pub fn active_count(&self, task: TaskType) -> usize {
        self.workers
            .lock()
            .expect("worker registry lock")
            .keys()
            .filter(|(t, _)| *t == task)
            .count()
    }

    /// Keys of active workers of `task`, ascending.
    pub fn active_keys(&self, task: TaskType) -> Vec<String> {
        let mut keys: Vec<String> = self
            .workers
            .lock()
            .expect("worker registry lock")
            .keys()
            .filter(|(t, _)| *t == task)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn is_registered(&self, task: TaskType, key: &str) -> bool {
        self.workers
            .lock()
            .expect("worker registry lock")
            .contains_key(&(task, key.to_string()))
    }

    /// Signal one worker to stop and wait for it to deregister.
    pub async fn stop(
        &self,
        task: TaskType,
        key: &str,
        timeout: Duration,
    ) -> Result<(), WorkerError> {
        {
            let map = self.workers.lock().expect("worker registry lock");
            match map.get(&(task, key.to_string())) {
                Some(entry) => entry.cancel.cancel(),
                None => return Ok(()), // already gone
            }
        }

        let deadline = Instant::now() + timeout;
        while self.is_registered(task, key) {
            if Instant::now() >= deadline {
                return Err(WorkerError::StopTimeout {
                    task,
                    pending: vec![key.to_string()],
                    timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    /// Wait until no worker of `task` remains. With a deadline, overruns
    /// report the workers still pending.
    pub async fn join_all(
        &self,
        task: TaskType,
        deadline: Option<Duration>,
    ) -> Result<(), WorkerError> {
        let limit = deadline.map(|d| Instant::now() + d);
        loop {
            if self.active_count(task) == 0 {
                return Ok(());
            }
            if let Some(limit) = limit {
                if Instant::now() >= limit {
                    return Err(WorkerError::StopTimeout {
                        task,
                        pending: self.active_keys(task),
                        timeout: deadline.unwrap_or_default(),
                    });
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
