//! Process-exec back-end: run the external tool in a per-task workspace
//! and supervise it to completion.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backend::{ProgressUpdate, TaskBackend};
use crate::monitor::ProcessMonitor;
use crate::session::SessionManager;
use crate::task::{ExecutionResult, TaskDescriptor};
use crate::workspace::WorkspaceManager;

/// Liveness poll period for the supervision loop.
const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(2);

/// Progress estimates are capped here until the task actually finishes.
const PROGRESS_CAP: u8 = 95;

pub struct ProcessExecBackend {
    workspaces: Arc<WorkspaceManager>,
    sessions: Arc<SessionManager>,
    monitor: Arc<ProcessMonitor>,
    max_execution_time: Duration,
    auto_cleanup: bool,
    poll_period: Duration,
}

impl ProcessExecBackend {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        sessions: Arc<SessionManager>,
        monitor: Arc<ProcessMonitor>,
        max_execution_time: Duration,
        auto_cleanup: bool,
    ) -> Self {
        Self {
            workspaces,
            sessions,
            monitor,
            max_execution_time,
            auto_cleanup,
            poll_period: DEFAULT_POLL_PERIOD,
        }
    }

    /// Shorten the supervision poll period (tests).
    #[cfg(test)]
    pub fn with_poll_period(mut self, period: Duration) -> Self {
        self.poll_period = period;
        self
    }

    /// The prompt handed to the external tool as its single argument.
    fn format_prompt(task: &TaskDescriptor) -> String {
        let mut parts = vec![
            "You are an autonomous task executor working inside an isolated workspace."
                .to_string(),
            String::new(),
            "TASK:".to_string(),
            task.description.clone(),
            String::new(),
        ];

        if !task.context.is_empty() {
            parts.push("CONTEXT:".to_string());
            for (key, value) in &task.context {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                parts.push(format!("- {key}: {rendered}"));
            }
            parts.push(String::new());
        }

        parts.extend(
            [
                "WORKSPACE STRUCTURE:",
                "- ./input/       : Input files provided for this task",
                "- ./output/      : Place any generated files here",
                "- ./logs/        : Place any log files here",
                "",
                "INSTRUCTIONS:",
                "1. Review the task and any input files",
                "2. Complete the requested work",
                "3. Save results to ./output/ directory",
                "4. Provide a summary of what you accomplished",
                "",
                "Please begin the task now.",
            ]
            .map(String::from),
        );

        parts.join("\n")
    }

    /// Poll the session until it finishes or the deadline passes. Returns
    /// `true` on natural completion. Progress estimates go out whenever the
    /// output log grew since the last look.
    async fn supervise(
        &self,
        task_id: &str,
        session_id: &str,
        output_log: &Path,
        progress: Option<&mpsc::Sender<ProgressUpdate>>,
    ) -> bool {
        let started = Instant::now();
        let mut last_output_size = 0u64;

        while started.elapsed() < self.max_execution_time {
            if !self.sessions.is_running(session_id).await {
                tracing::info!(task_id, "tool session finished");
                return true;
            }

            if let Some(sender) = progress {
                let output_size = std::fs::metadata(output_log).map(|m| m.len()).unwrap_or(0);
                if output_size > last_output_size {
                    last_output_size = output_size;
                    let elapsed = started.elapsed().as_secs_f64();
                    let total = self.max_execution_time.as_secs_f64();
                    let percent = ((elapsed / total) * 100.0) as u8;
                    let _ = sender.try_send(ProgressUpdate {
                        task_id: task_id.to_string(),
                        percent: percent.min(PROGRESS_CAP),
                    });
                }
            }

            tokio::time::sleep(self.poll_period).await;
        }

        tracing::warn!(
            task_id,
            "task exceeded maximum execution time ({}s)",
            self.max_execution_time.as_secs()
        );
        false
    }
}

#[async_trait]
impl TaskBackend for ProcessExecBackend {
    async fn execute(
        &self,
        task: &TaskDescriptor,
        progress: Option<mpsc::Sender<ProgressUpdate>>,
    ) -> ExecutionResult {
        let started = Instant::now();

        let workspace = match self.workspaces.create(&task.id) {
            Ok(workspace) => workspace,
            Err(e) => {
                tracing::error!(task_id = %task.id, "workspace creation failed: {e}");
                return ExecutionResult::failure(e.to_string(), started.elapsed().as_secs_f64());
            }
        };

        let files = task.files.clone().unwrap_or_default();
        if let Err(e) = self.workspaces.populate(&workspace, &files, &task.context) {
            tracing::error!(task_id = %task.id, "workspace population failed: {e}");
            if self.auto_cleanup {
                self.workspaces.destroy(&workspace);
            }
            return ExecutionResult::failure(e.to_string(), started.elapsed().as_secs_f64());
        }

        let prompt = Self::format_prompt(task);
        let session = match self
            .sessions
            .spawn(&task.id, &workspace, &prompt, self.max_execution_time)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(task_id = %task.id, "session spawn failed: {e}");
                if self.auto_cleanup {
                    self.workspaces.destroy(&workspace);
                }
                return ExecutionResult::failure(e.to_string(), started.elapsed().as_secs_f64());
            }
        };

        if let Some(pid) = session.pid {
            self.monitor
                .attach(
                    pid,
                    Some(session.output_log.clone()),
                    Some(session.error_log.clone()),
                )
                .await;
        }

        let completed = self
            .supervise(
                &task.id,
                &session.session_id,
                &session.output_log,
                progress.as_ref(),
            )
            .await;

        let result = if completed {
            let output = self.sessions.output(&session.session_id).await;
            let error = self.sessions.error(&session.session_id).await;
            let exit_code = self.sessions.exit_code(&session.session_id).await;
            let artifacts = self.workspaces.collect_artifacts(&workspace);

            // A readable non-zero code is a failure; only a session that
            // never exposed a code at all gets the benefit of the doubt.
            let success = exit_code.is_none_or(|code| code == 0);
            let error = if success {
                None
            } else if error.trim().is_empty() {
                Some(format!(
                    "tool exited with code {}",
                    exit_code.unwrap_or(-1)
                ))
            } else {
                Some(error)
            };

            tracing::info!(
                task_id = %task.id,
                success,
                ?exit_code,
                artifacts = artifacts.len(),
                "terminal execution finished"
            );

            ExecutionResult {
                success,
                response: output,
                usage: None,
                artifacts,
                execution_time_seconds: started.elapsed().as_secs_f64(),
                exit_code,
                error,
                model: None,
            }
        } else {
            // Deadline: tell the monitor, then bring the tool down.
            if let Some(pid) = session.pid {
                self.monitor.signal_timeout(pid).await;
            }
            self.sessions.terminate(&session.session_id, false).await;
            if self.sessions.is_running(&session.session_id).await {
                self.sessions.terminate(&session.session_id, true).await;
                if let Some(pid) = session.pid {
                    self.monitor.signal_kill(pid).await;
                }
            }

            ExecutionResult::failure(
                format!(
                    "exceeded maximum execution time ({}s)",
                    self.max_execution_time.as_secs()
                ),
                started.elapsed().as_secs_f64(),
            )
        };

        self.sessions.close(&session.session_id).await;
        if let Some(pid) = session.pid {
            self.monitor.detach(pid).await;
        }
        if self.auto_cleanup {
            self.workspaces.destroy(&workspace);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use crate::config::WindowMode;

    /// Write a stand-in external tool and return its path.
    #[cfg(unix)]
    fn stub_tool(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("tool.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn backend(
        base: &Path,
        tool: &str,
        timeout: Duration,
        auto_cleanup: bool,
    ) -> ProcessExecBackend {
        ProcessExecBackend::new(
            Arc::new(WorkspaceManager::new(base, serde_json::json!({}))),
            Arc::new(SessionManager::new(tool, WindowMode::Headless)),
            Arc::new(ProcessMonitor::with_interval(Duration::from_millis(50))),
            timeout,
            auto_cleanup,
        )
        .with_poll_period(Duration::from_millis(100))
    }

    fn task(id: &str, files: serde_json::Value) -> TaskDescriptor {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "description": "emit file",
            "execution_mode": "process",
            "files": files,
        }))
        .unwrap()
    }

    #[test]
    fn prompt_describes_workspace_layout() {
        let task: TaskDescriptor = serde_json::from_value(serde_json::json!({
            "id": "t0",
            "description": "do the thing",
            "context": {"branch": "main"},
        }))
        .unwrap();

        let prompt = ProcessExecBackend::format_prompt(&task);
        assert!(prompt.contains("TASK:\ndo the thing"));
        assert!(prompt.contains("- branch: main"));
        assert!(prompt.contains("./output/"));
        assert!(prompt.contains("Save results to ./output/"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tool_that_writes_artifact_succeeds() {
        let dir = tempdir().unwrap();
        let tool = stub_tool(
            dir.path(),
            "echo \"working\"\nprintf done > output/result.md\nexit 0",
        );
        let base = dir.path().join("ws");

        let backend = backend(&base, &tool, Duration::from_secs(10), false);
        let result = backend
            .execute(&task("t1", serde_json::json!({"in.txt": "x"})), None)
            .await;

        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.response.contains("working"));
        assert_eq!(result.artifacts.len(), 1);
        assert_eq!(result.artifacts[0].name, "result.md");
        assert_eq!(result.artifacts[0].inline_content.as_deref(), Some("done"));

        // auto_cleanup off: the workspace is still on disk with its trees.
        let kept: Vec<_> = std::fs::read_dir(&base).unwrap().flatten().collect();
        assert_eq!(kept.len(), 1);
        assert!(kept[0].path().join("input/in.txt").is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn auto_cleanup_destroys_workspace() {
        let dir = tempdir().unwrap();
        let tool = stub_tool(dir.path(), "exit 0");
        let base = dir.path().join("ws");

        let backend = backend(&base, &tool, Duration::from_secs(10), true);
        let result = backend.execute(&task("t2", serde_json::json!({})), None).await;

        assert!(result.success);
        let kept: Vec<_> = std::fs::read_dir(&base).unwrap().flatten().collect();
        assert!(kept.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_code_is_failure() {
        let dir = tempdir().unwrap();
        let tool = stub_tool(dir.path(), "echo oops >&2\nexit 3");
        let base = dir.path().join("ws");

        let backend = backend(&base, &tool, Duration::from_secs(10), true);
        let result = backend.execute(&task("t3", serde_json::json!({})), None).await;

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert!(result.error.as_deref().unwrap().contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deadline_produces_timeout_failure_and_cleans_up() {
        let dir = tempdir().unwrap();
        let tool = stub_tool(dir.path(), "sleep 10");
        let base = dir.path().join("ws");

        let backend = backend(&base, &tool, Duration::from_secs(1), true);
        let started = Instant::now();
        let result = backend.execute(&task("t4", serde_json::json!({})), None).await;

        assert!(!result.success);
        assert!(
            result
                .error
                .as_deref()
                .unwrap()
                .contains("exceeded maximum execution time")
        );
        // Termination and cleanup add little on top of the 1 s deadline.
        assert!(started.elapsed() < Duration::from_secs(8));
        let kept: Vec<_> = std::fs::read_dir(&base).unwrap().flatten().collect();
        assert!(kept.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn progress_estimates_are_capped() {
        let dir = tempdir().unwrap();
        // Emit output over time so the log keeps growing.
        let tool = stub_tool(
            dir.path(),
            "for i in 1 2 3 4 5; do echo step $i; sleep 0.2; done",
        );
        let base = dir.path().join("ws");

        let backend = backend(&base, &tool, Duration::from_secs(2), true);
        let (tx, mut rx) = mpsc::channel(64);
        let result = backend
            .execute(&task("t5", serde_json::json!({})), Some(tx))
            .await;
        assert!(result.success);

        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        assert!(!updates.is_empty());
        assert!(updates.iter().all(|u| u.percent <= 95));
        assert!(updates.iter().all(|u| u.task_id == "t5"));
    }
}
