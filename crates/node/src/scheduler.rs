//! Periodic task dispatcher. One SCHEDULER worker ticks every second and
//! runs whichever registered tasks are due. Tasks are short dispatches
//! (state refresh, cache refresh, auto-irrigation check); anything
//! long-running must spawn its own worker instead of blocking the loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::WorkerError;
use crate::executor::WORKER_STOP_DEADLINE;
use crate::workers::{TaskType, WorkerRegistry};

const TICK: Duration = Duration::from_secs(1);
const SCHEDULER_KEY: &str = "main";

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

struct ScheduledTask {
    name: String,
    interval: Duration,
    last_run: Option<Instant>,
    action: TaskFn,
}

pub struct TaskScheduler {
    registry: WorkerRegistry,
    tasks: Arc<Mutex<Vec<ScheduledTask>>>,
}

impl TaskScheduler {
    pub fn new(registry: WorkerRegistry) -> Self {
        Self {
            registry,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a periodic task. The first run happens on the next tick.
    pub fn register<F, Fut>(
        &self,
        name: &str,
        interval: Duration,
        action: F,
    ) -> Result<(), WorkerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().expect("scheduler tasks lock");
        if tasks.iter().any(|t| t.name == name) {
            return Err(WorkerError::AlreadyExists {
                task: TaskType::Scheduler,
                key: name.to_string(),
            });
        }
        tasks.push(ScheduledTask {
            name: name.to_string(),
            interval,
            last_run: None,
            action: Arc::new(move || Box::pin(action()) as TaskFuture),
        });
        info!(task = name, interval_secs = interval.as_secs(), "task registered");
        Ok(())
    }

    pub fn unregister(&self, name: &str) {
        self.tasks
            .lock()
            .expect("scheduler tasks lock")
            .retain(|t| t.name != name);
    }

    /// Start the scheduler worker. Fails if one is already running.
    pub fn start(&self) -> Result<(), WorkerError> {
        let cancel = CancellationToken::new();
        let tasks = Arc::clone(&self.tasks);
        let loop_cancel = cancel.clone();
        self.registry.spawn(
            TaskType::Scheduler,
            SCHEDULER_KEY,
            cancel,
            run_loop(tasks, loop_cancel),
        )?;
        info!("task scheduler started");
        Ok(())
    }

    /// Stop the scheduler worker with a bounded join.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        self.registry
            .stop(TaskType::Scheduler, SCHEDULER_KEY, WORKER_STOP_DEADLINE)
            .await?;
        info!("task scheduler stopped");
        Ok(())
    }
}

async fn run_loop(tasks: Arc<Mutex<Vec<ScheduledTask>>>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        // Collect what is due under the lock, run outside it.
        let due: Vec<(String, TaskFn)> = {
            let mut tasks = tasks.lock().expect("scheduler tasks lock");
            let now = Instant::now();
            tasks
                .iter_mut()
                .filter(|t| t.last_run.map_or(true, |last| now - last >= t.interval))
                .map(|t| {
                    t.last_run = Some(now);
                    (t.name.clone(), Arc::clone(&t.action))
                })
                .collect()
        };

        for (name, action) in due {
            debug!(task = %name, "running scheduled task");
            action().await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_task(counter: Arc<AtomicUsize>) -> impl Fn() -> TaskFuture + Send + Sync {
        move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }) as TaskFuture
        }
    }

    #[tokio::test(start_paused = true)]
    async fn task_runs_at_its_interval() {
        let scheduler = TaskScheduler::new(WorkerRegistry::new());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .register("tick", Duration::from_secs(5), counter_task(Arc::clone(&counter)))
            .unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_secs(11)).await;
        let runs = counter.load(Ordering::SeqCst);
        assert!((2..=4).contains(&runs), "unexpected run count {runs}");

        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn multiple_tasks_with_different_intervals() {
        let scheduler = TaskScheduler::new(WorkerRegistry::new());
        let fast = Arc::new(AtomicUsize::new(0));
        let slow = Arc::new(AtomicUsize::new(0));
        scheduler
            .register("fast", Duration::from_secs(2), counter_task(Arc::clone(&fast)))
            .unwrap();
        scheduler
            .register("slow", Duration::from_secs(10), counter_task(Arc::clone(&slow)))
            .unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(fast.load(Ordering::SeqCst) > slow.load(Ordering::SeqCst));
        assert!(slow.load(Ordering::SeqCst) >= 2);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_task_name_rejected() {
        let scheduler = TaskScheduler::new(WorkerRegistry::new());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .register("t", Duration::from_secs(1), counter_task(Arc::clone(&counter)))
            .unwrap();
        let err = scheduler
            .register("t", Duration::from_secs(1), counter_task(counter))
            .unwrap_err();
        assert!(matches!(err, WorkerError::AlreadyExists { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_rejected() {
        let scheduler = TaskScheduler::new(WorkerRegistry::new());
        scheduler.start().unwrap();
        assert!(matches!(
            scheduler.start(),
            Err(WorkerError::AlreadyExists { .. })
        ));
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_the_loop() {
        let scheduler = TaskScheduler::new(WorkerRegistry::new());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .register("tick", Duration::from_secs(1), counter_task(Arc::clone(&counter)))
            .unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.stop().await.unwrap();
        let after_stop = counter.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_allowed() {
        let scheduler = TaskScheduler::new(WorkerRegistry::new());
        scheduler.start().unwrap();
        scheduler.stop().await.unwrap();
        scheduler.start().unwrap();
        scheduler.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_removes_task() {
        let scheduler = TaskScheduler::new(WorkerRegistry::new());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .register("tick", Duration::from_secs(1), counter_task(Arc::clone(&counter)))
            .unwrap();
        scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        scheduler.unregister("tick");
        let snapshot = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), snapshot);
        scheduler.stop().await.unwrap();
    }
}
