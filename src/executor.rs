//! Executor core: the polling/lease/execution pipeline.
//!
//! One poller task leases work from the orchestrator into a bounded queue;
//! `max_concurrent_tasks` worker tasks drain it. Every accepted task gets
//! exactly one terminal report (`complete` or `fail`). Workers never
//! propagate errors — the worst a task can do is fail.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};

use crate::backend::{ModelApiBackend, ProcessExecBackend, ProgressUpdate, TaskBackend};
use crate::config::ExecutorConfig;
use crate::error::ExecutorError;
use crate::orchestrator::OrchestratorClient;
use crate::task::{ExecutionMode, ExecutionResult, TaskDescriptor};

/// How long a worker waits on the queue before re-checking the running
/// flag.
const QUEUE_WAIT: Duration = Duration::from_secs(1);

/// Sleep after a failed poll round before trying again.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Monotonic counters and gauges, readable concurrently.
#[derive(Debug, Default)]
struct AgentStats {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    total_tokens: AtomicU64,
    queued: AtomicUsize,
}

/// Point-in-time copy of the stats.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub total_tokens: u64,
}

impl AgentStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
        }
    }
}

/// What `status()` reports.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatus {
    pub running: bool,
    pub active_tasks: usize,
    pub queued_tasks: usize,
    pub stats: StatsSnapshot,
    pub config: ConfigSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub agent_name: String,
    pub max_concurrent_tasks: usize,
    pub poll_interval_seconds: u64,
}

/// Handle to the executor. Cloning shares the same underlying state.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    config: ExecutorConfig,
    client: Arc<OrchestratorClient>,
    api_backend: Arc<ModelApiBackend>,
    process_backend: Arc<ProcessExecBackend>,
    stats: AgentStats,
    running: AtomicBool,
    /// Tasks currently being executed, keyed by task id.
    active: Mutex<HashMap<String, Instant>>,
    queue_tx: Mutex<Option<mpsc::Sender<TaskDescriptor>>>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        client: Arc<OrchestratorClient>,
        api_backend: Arc<ModelApiBackend>,
        process_backend: Arc<ProcessExecBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                client,
                api_backend,
                process_backend,
                stats: AgentStats::default(),
                running: AtomicBool::new(false),
                active: Mutex::new(HashMap::new()),
                queue_tx: Mutex::new(None),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Probe the orchestrator and the model API, then launch the poller and
    /// the worker pool. Refuses to start when either probe fails.
    pub async fn start(&self) -> Result<(), ExecutorError> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(ExecutorError::AlreadyRunning);
        }
        if let Err(e) = inner.config.validate() {
            inner.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        tracing::info!("testing orchestrator connection...");
        if !inner.client.health().await {
            inner.running.store(false, Ordering::SeqCst);
            return Err(ExecutorError::StartupProbe {
                service: "orchestrator".into(),
                reason: "health check failed".into(),
            });
        }
        tracing::info!("orchestrator connection ok");

        tracing::info!("testing model API connection...");
        if let Err(e) = inner.api_backend.probe().await {
            inner.running.store(false, Ordering::SeqCst);
            return Err(ExecutorError::StartupProbe {
                service: "model API".into(),
                reason: e.to_string(),
            });
        }
        tracing::info!("model API connection ok");

        let workers = inner.config.max_concurrent_tasks;
        let (tx, rx) = mpsc::channel::<TaskDescriptor>(workers);
        *inner.queue_tx.lock().await = Some(tx);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = inner.handles.lock().await;
        handles.push(tokio::spawn(Arc::clone(inner).polling_loop()));
        for worker_id in 0..workers {
            handles.push(tokio::spawn(
                Arc::clone(inner).worker_loop(worker_id, Arc::clone(&rx)),
            ));
        }

        tracing::info!("executor started with {workers} worker(s)");
        Ok(())
    }

    /// Stop the executor: the poller halts immediately, workers finish
    /// their current task and exit, queued-but-unstarted tasks are dropped.
    /// Returns once everything has drained.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping executor...");

        // Dropping the sender closes the queue; whatever is still in it is
        // never delivered. The orchestrator reclaims those leases by its
        // own policy.
        *inner.queue_tx.lock().await = None;

        let handles = std::mem::take(&mut *inner.handles.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("executor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> ExecutorStatus {
        let inner = &self.inner;
        ExecutorStatus {
            running: self.is_running(),
            active_tasks: inner.active.lock().await.len(),
            queued_tasks: inner.stats.queued.load(Ordering::Relaxed),
            stats: inner.stats.snapshot(),
            config: ConfigSummary {
                agent_name: inner.config.agent_name.clone(),
                max_concurrent_tasks: inner.config.max_concurrent_tasks,
                poll_interval_seconds: inner.config.poll_interval_seconds,
            },
        }
    }
}

impl Inner {
    /// Fetch pending tasks and lease as many as capacity allows, forever.
    async fn polling_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.poll_interval_seconds);
        tracing::info!("polling loop started (interval: {}s)", interval.as_secs());

        while self.running.load(Ordering::SeqCst) {
            let polled_ok = self.poll_once().await;

            // Sleep in short slices so stop() is observed promptly.
            let mut remaining = if polled_ok { interval } else { POLL_RETRY_DELAY };
            while remaining > Duration::ZERO && self.running.load(Ordering::SeqCst) {
                let step = remaining.min(Duration::from_secs(1));
                tokio::time::sleep(step).await;
                remaining -= step;
            }
        }
        tracing::info!("polling loop ended");
    }

    async fn poll_once(&self) -> bool {
        let tasks = self.client.pending_tasks(&self.config.agent_name).await;
        if tasks.is_empty() {
            return true;
        }
        tracing::info!("found {} pending task(s)", tasks.len());

        for task in tasks {
            let in_flight =
                self.active.lock().await.len() + self.stats.queued.load(Ordering::Relaxed);
            if in_flight >= self.config.max_concurrent_tasks {
                tracing::debug!("at max capacity, deferring remaining tasks to next poll");
                break;
            }

            // Another agent may win the lease; that is not our problem.
            if !self.client.accept_task(&task.id, &self.config.agent_name).await {
                continue;
            }

            self.stats.queued.fetch_add(1, Ordering::Relaxed);
            let tx = self.queue_tx.lock().await.clone();
            let enqueued = match tx {
                Some(tx) => tx.send(task).await.is_ok(),
                None => false,
            };
            if !enqueued {
                self.stats.queued.fetch_sub(1, Ordering::Relaxed);
                return false;
            }
        }
        true
    }

    /// Take tasks off the queue until the executor stops.
    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        rx: Arc<Mutex<mpsc::Receiver<TaskDescriptor>>>,
    ) {
        tracing::info!(worker_id, "worker started");

        while self.running.load(Ordering::SeqCst) {
            let task = {
                let mut rx = rx.lock().await;
                match tokio::time::timeout(QUEUE_WAIT, rx.recv()).await {
                    Ok(Some(task)) => task,
                    Ok(None) => break,
                    Err(_) => continue,
                }
            };

            self.execute_task(worker_id, task).await;
        }

        tracing::info!(worker_id, "worker stopped");
    }

    /// Run one task end to end and issue its single terminal report.
    async fn execute_task(&self, worker_id: usize, task: TaskDescriptor) {
        let task_id = task.id.clone();
        let started = Instant::now();

        self.stats.total.fetch_add(1, Ordering::Relaxed);
        // Count the task as active before it stops counting as queued, so
        // the poller's `active + queued` capacity gate can only over-count
        // a task in flight, never miss one.
        self.active.lock().await.insert(task_id.clone(), started);
        self.stats.queued.fetch_sub(1, Ordering::Relaxed);

        let mode = task.execution_mode.unwrap_or(self.config.execution_mode);
        tracing::info!(worker_id, %task_id, %mode, "executing task");

        self.client
            .update_task_status(&task_id, "in_progress", Some(0))
            .await;

        // Forward intermediate progress estimates from the back-end.
        let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressUpdate>(16);
        let progress_client = Arc::clone(&self.client);
        let progress_forwarder = tokio::spawn(async move {
            while let Some(update) = progress_rx.recv().await {
                progress_client
                    .update_task_status(&update.task_id, "in_progress", Some(update.percent))
                    .await;
            }
        });

        let backend: Arc<dyn TaskBackend> = match mode {
            ExecutionMode::Api => Arc::clone(&self.api_backend) as Arc<dyn TaskBackend>,
            ExecutionMode::Process => Arc::clone(&self.process_backend) as Arc<dyn TaskBackend>,
        };

        // The back-end runs in its own task so that even a panic inside it
        // ends as a plain `fail` report instead of taking the worker down.
        let execution = {
            let task = task.clone();
            tokio::spawn(async move { backend.execute(&task, Some(progress_tx)).await })
        };

        match execution.await {
            Ok(result) => {
                if result.success {
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    if let Some(usage) = &result.usage {
                        self.stats
                            .total_tokens
                            .fetch_add(usage.total_tokens, Ordering::Relaxed);
                    }
                    self.client.complete_task(&task_id, &result).await;
                    self.push_inline_artifacts(&task_id, &result).await;
                    tracing::info!(worker_id, %task_id, "task completed");
                } else {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    let error = result.error.as_deref().unwrap_or("unknown error");
                    self.client.fail_task(&task_id, error).await;
                    tracing::error!(worker_id, %task_id, error, "task failed");
                }
            }
            Err(join_error) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let error = format!("internal execution error: {join_error}");
                tracing::error!(worker_id, %task_id, "{error}");
                self.client.fail_task(&task_id, &error).await;
            }
        }

        // The forwarder ends once the back-end's progress sender is gone.
        let _ = progress_forwarder.await;
        self.active.lock().await.remove(&task_id);
    }

    /// Best-effort upload of small text artifacts after completion.
    async fn push_inline_artifacts(&self, task_id: &str, result: &ExecutionResult) {
        for artifact in &result.artifacts {
            if let Some(content) = &artifact.inline_content {
                self.client
                    .upload_artifact(task_id, &artifact.name, content)
                    .await;
            }
        }
    }
}
