//! Per-process observation: liveness, resource gauges, incremental log
//! tailing, and completion/timeout/kill events for subscribers.
//!
//! One monitoring task runs per attached PID, ticking roughly once a
//! second. The metrics table is guarded by a single lock; reads hand out
//! snapshots. Subscriber callbacks run outside the lock and must not block
//! or panic: the process aborts on panic in release builds, so a panicking
//! callback would take the whole agent down, not just its monitor.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;

/// Backstop on concurrently monitored processes.
const MAX_ATTACHED: usize = 64;

/// Execution state of a monitored process. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Completed,
    Failed,
    TimedOut,
    Killed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Completed
                | ProcessState::Failed
                | ProcessState::TimedOut
                | ProcessState::Killed
        )
    }
}

/// Metrics for one monitored process.
#[derive(Debug, Clone)]
pub struct ProcessMetrics {
    pub pid: u32,
    pub start_time: SystemTime,
    /// Set exactly when a terminal state is entered.
    pub end_time: Option<SystemTime>,
    pub state: ProcessState,
    pub cpu_pct: f64,
    pub memory_mb: f64,
    pub output_lines: u64,
    pub error_lines: u64,
    pub exit_code: Option<i32>,
}

impl ProcessMetrics {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            start_time: SystemTime::now(),
            end_time: None,
            state: ProcessState::Starting,
            cpu_pct: 0.0,
            memory_mb: 0.0,
            output_lines: 0,
            error_lines: 0,
            exit_code: None,
        }
    }

    /// Seconds between start and end (or now, while still running).
    pub fn runtime_seconds(&self) -> f64 {
        let end = self.end_time.unwrap_or_else(SystemTime::now);
        end.duration_since(self.start_time)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Events delivered to subscribers.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// New bytes appeared in the stdout log.
    Output(String),
    /// New bytes appeared in the stderr log.
    Error(String),
    Completed,
    TimedOut,
    Killed,
}

pub type Subscriber = Arc<dyn Fn(u32, &MonitorEvent) + Send + Sync>;

struct Monitored {
    metrics: ProcessMetrics,
    subscribers: Vec<Subscriber>,
}

pub struct ProcessMonitor {
    check_interval: Duration,
    table: Arc<Mutex<HashMap<u32, Monitored>>>,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    pub fn with_interval(check_interval: Duration) -> Self {
        Self {
            check_interval,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start monitoring a PID, optionally tailing its log files.
    ///
    /// Returns the initial metrics snapshot, or `None` when the attachment
    /// backstop is hit.
    pub async fn attach(
        &self,
        pid: u32,
        stdout_path: Option<PathBuf>,
        stderr_path: Option<PathBuf>,
    ) -> Option<ProcessMetrics> {
        {
            let mut table = self.table.lock().await;
            if table.len() >= MAX_ATTACHED {
                tracing::warn!(pid, "monitor attachment backstop reached, not attaching");
                return None;
            }
            table.insert(
                pid,
                Monitored {
                    metrics: ProcessMetrics::new(pid),
                    subscribers: Vec::new(),
                },
            );
        }

        tracing::info!(pid, "attached to process");

        let table = Arc::clone(&self.table);
        let interval = self.check_interval;
        tokio::spawn(monitor_loop(table, pid, stdout_path, stderr_path, interval));

        self.metrics(pid).await
    }

    /// Register a callback for this PID's events.
    ///
    /// Callbacks run on the monitor task and must not block or panic.
    pub async fn subscribe(&self, pid: u32, callback: Subscriber) {
        if let Some(entry) = self.table.lock().await.get_mut(&pid) {
            entry.subscribers.push(callback);
        }
    }

    /// Mark the process timed out. External input only: the monitor itself
    /// never kills anything.
    pub async fn signal_timeout(&self, pid: u32) {
        self.enter_terminal(pid, ProcessState::TimedOut, MonitorEvent::TimedOut)
            .await;
    }

    /// Mark the process killed.
    pub async fn signal_kill(&self, pid: u32) {
        self.enter_terminal(pid, ProcessState::Killed, MonitorEvent::Killed)
            .await;
    }

    async fn enter_terminal(&self, pid: u32, state: ProcessState, event: MonitorEvent) {
        let subscribers = {
            let mut table = self.table.lock().await;
            let Some(entry) = table.get_mut(&pid) else {
                return;
            };
            if entry.metrics.state.is_terminal() {
                return;
            }
            entry.metrics.state = state;
            entry.metrics.end_time = Some(SystemTime::now());
            entry.subscribers.clone()
        };

        tracing::info!(pid, ?state, "process entered terminal state");
        deliver(&subscribers, pid, &event);
    }

    /// Current metrics snapshot for a PID.
    pub async fn metrics(&self, pid: u32) -> Option<ProcessMetrics> {
        self.table.lock().await.get(&pid).map(|e| e.metrics.clone())
    }

    /// Stop monitoring a PID. The loop notices on its next tick.
    pub async fn detach(&self, pid: u32) {
        if self.table.lock().await.remove(&pid).is_some() {
            tracing::info!(pid, "detached from process");
        }
    }
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

async fn monitor_loop(
    table: Arc<Mutex<HashMap<u32, Monitored>>>,
    pid: u32,
    stdout_path: Option<PathBuf>,
    stderr_path: Option<PathBuf>,
    check_interval: Duration,
) {
    tracing::debug!(pid, "monitor loop started");
    let mut last_stdout_size: u64 = 0;
    let mut last_stderr_size: u64 = 0;
    let mut interval = tokio::time::interval(check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        // Detached or externally finished: nothing left to observe.
        {
            let table = table.lock().await;
            match table.get(&pid) {
                None => break,
                Some(entry) if entry.metrics.state.is_terminal() => break,
                Some(_) => {}
            }
        }

        if !pid_alive(pid) {
            let subscribers = {
                let mut table = table.lock().await;
                let Some(entry) = table.get_mut(&pid) else { break };
                if entry.metrics.state.is_terminal() {
                    break;
                }
                entry.metrics.state = ProcessState::Completed;
                entry.metrics.end_time = Some(SystemTime::now());
                entry.subscribers.clone()
            };
            tracing::info!(pid, "process completed");
            deliver(&subscribers, pid, &MonitorEvent::Completed);
            break;
        }

        let sample = sample_resources(pid).await;

        let mut events = Vec::new();
        if let Some(path) = stdout_path.as_deref() {
            if let Some((chunk, new_size)) = read_new_content(path, last_stdout_size) {
                last_stdout_size = new_size;
                events.push((MonitorEvent::Output(chunk), true));
            }
        }
        if let Some(path) = stderr_path.as_deref() {
            if let Some((chunk, new_size)) = read_new_content(path, last_stderr_size) {
                last_stderr_size = new_size;
                events.push((MonitorEvent::Error(chunk), false));
            }
        }

        let subscribers = {
            let mut table = table.lock().await;
            let Some(entry) = table.get_mut(&pid) else { break };

            if entry.metrics.state == ProcessState::Starting {
                entry.metrics.state = ProcessState::Running;
            }
            if let Some((cpu, mem)) = sample {
                entry.metrics.cpu_pct = cpu;
                entry.metrics.memory_mb = mem;
            }
            for (event, is_stdout) in &events {
                let lines = match event {
                    MonitorEvent::Output(chunk) | MonitorEvent::Error(chunk) => {
                        chunk.matches('\n').count() as u64
                    }
                    _ => 0,
                };
                if *is_stdout {
                    entry.metrics.output_lines += lines;
                } else {
                    entry.metrics.error_lines += lines;
                }
            }
            entry.subscribers.clone()
        };

        for (event, _) in &events {
            deliver(&subscribers, pid, event);
        }
    }

    tracing::debug!(pid, "monitor loop ended");
}

/// Invoke every subscriber outside the table lock. Release builds abort on
/// panic, so there is no net to catch a panicking callback here; the
/// [`subscribe`](ProcessMonitor::subscribe) contract forbids them instead.
fn deliver(subscribers: &[Subscriber], pid: u32, event: &MonitorEvent) {
    for subscriber in subscribers {
        subscriber(pid, event);
    }
}

/// Best-effort CPU and resident-memory sample via `ps`.
async fn sample_resources(pid: u32) -> Option<(f64, f64)> {
    let output = tokio::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "%cpu=,rss="])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let mut fields = text.split_whitespace();
    let cpu: f64 = fields.next()?.parse().ok()?;
    let rss_kb: f64 = fields.next()?.parse().ok()?;
    Some((cpu, rss_kb / 1024.0))
}

/// Read the byte range `[last_size, current_size)` of a growing log file.
/// Returns `None` when the file is missing or has not grown.
fn read_new_content(path: &Path, last_size: u64) -> Option<(String, u64)> {
    let metadata = std::fs::metadata(path).ok()?;
    let current_size = metadata.len();
    if current_size <= last_size {
        return None;
    }

    let mut file = std::fs::File::open(path).ok()?;
    file.seek(SeekFrom::Start(last_size)).ok()?;
    let mut buf = vec![0u8; (current_size - last_size) as usize];
    file.read_exact(&mut buf).ok()?;
    Some((String::from_utf8_lossy(&buf).into_owned(), current_size))
}

fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn fast_monitor() -> ProcessMonitor {
        ProcessMonitor::with_interval(Duration::from_millis(25))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn short_lived_process_reaches_completed() {
        let monitor = fast_monitor();
        let child = tokio::process::Command::new("/bin/sleep")
            .arg("0.1")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let completed = Arc::new(AtomicU32::new(0));
        monitor.attach(pid, None, None).await.unwrap();
        let flag = Arc::clone(&completed);
        monitor
            .subscribe(
                pid,
                Arc::new(move |_, event| {
                    if matches!(event, MonitorEvent::Completed) {
                        flag.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .await;

        // Keep the child from lingering as a zombie that still answers
        // signal-0 probes.
        tokio::spawn(async move {
            let mut child = child;
            let _ = child.wait().await;
        });

        tokio::time::sleep(Duration::from_millis(600)).await;

        let metrics = monitor.metrics(pid).await.unwrap();
        assert_eq!(metrics.state, ProcessState::Completed);
        assert!(metrics.end_time.is_some());
        assert!(metrics.runtime_seconds() > 0.0);
        // The completion event fired exactly once.
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        monitor.detach(pid).await;
        assert!(monitor.metrics(pid).await.is_none());
    }

    #[tokio::test]
    async fn terminal_states_are_absorbing() {
        let monitor = fast_monitor();
        // Attach to ourselves: definitely alive for the whole test.
        let pid = std::process::id();
        monitor.attach(pid, None, None).await.unwrap();

        monitor.signal_timeout(pid).await;
        let metrics = monitor.metrics(pid).await.unwrap();
        assert_eq!(metrics.state, ProcessState::TimedOut);
        let first_end = metrics.end_time.unwrap();

        // A later kill signal cannot overwrite the terminal state.
        monitor.signal_kill(pid).await;
        let metrics = monitor.metrics(pid).await.unwrap();
        assert_eq!(metrics.state, ProcessState::TimedOut);
        assert_eq!(metrics.end_time.unwrap(), first_end);

        monitor.detach(pid).await;
    }

    #[tokio::test]
    async fn log_growth_is_tailed_incrementally() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("out.log");
        std::fs::write(&log, "").unwrap();

        let monitor = fast_monitor();
        let pid = std::process::id();
        monitor
            .attach(pid, Some(log.clone()), None)
            .await
            .unwrap();

        let chunks: Arc<std::sync::Mutex<Vec<String>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&chunks);
        monitor
            .subscribe(
                pid,
                Arc::new(move |_, event| {
                    if let MonitorEvent::Output(chunk) = event {
                        sink.lock().unwrap().push(chunk.clone());
                    }
                }),
            )
            .await;

        std::fs::write(&log, "line one\n").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        file.write_all(b"line two\nline three\n").unwrap();
        drop(file);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let metrics = monitor.metrics(pid).await.unwrap();
        assert_eq!(metrics.state, ProcessState::Running);
        assert_eq!(metrics.output_lines, 3);

        let collected = chunks.lock().unwrap().join("");
        assert_eq!(collected, "line one\nline two\nline three\n");

        monitor.detach(pid).await;
    }

    #[tokio::test]
    async fn attachment_backstop_refuses_excess_pids() {
        let monitor = fast_monitor();
        for pid in 1_000_000..1_000_000 + MAX_ATTACHED as u32 {
            // Fake PIDs: the loops exit on their first liveness probe, but
            // table entries persist until detached.
            monitor.signal_kill(pid).await; // no-op, not yet attached
            assert!(monitor.attach(pid, None, None).await.is_some());
            monitor.signal_kill(pid).await; // park the loop in a terminal state
        }
        assert!(monitor.attach(2_000_000, None, None).await.is_none());
    }
}
