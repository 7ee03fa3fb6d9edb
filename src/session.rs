//! Sessions of the external command-line tool.
//!
//! A session is one launched tool process plus its capture files. Three
//! launch modes exist: a visible window in the host's native terminal
//! application, a visible window in the alternate emulator, and a plain
//! headless child process. The windowed modes synthesise a shell script in
//! the workspace and hand it to a [`TerminalLauncher`]; the headless mode
//! owns the child handle directly.
//!
//! The session's output log file is the single authoritative source of the
//! tool's stdout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::WindowMode;
use crate::error::SessionError;

/// Grace period between SIGTERM and giving up on a graceful shutdown.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Delay before PID discovery after a windowed launch.
const PID_DISCOVERY_DELAY: Duration = Duration::from_secs(1);

/// An active (or finished) tool session. Cheap to clone; the process handle
/// stays with the manager.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub task_id: String,
    pub workspace: PathBuf,
    pub output_log: PathBuf,
    pub error_log: PathBuf,
    pub start_time: Instant,
    pub pid: Option<u32>,
}

struct SessionEntry {
    session: Session,
    /// Present only for headless sessions.
    child: Option<Child>,
    /// Exit code, once known.
    exit_code: Option<i32>,
}

/// Control channel to a host terminal application: open a visible window
/// running the given script. Implementations are OS-specific; unknown hosts
/// have none and the manager degrades to headless.
#[async_trait]
pub trait TerminalLauncher: Send + Sync {
    async fn open_window(&self, script: &Path, title: &str) -> Result<(), SessionError>;
}

/// Native terminal application, driven over the OSA scripting channel.
pub struct NativeTerminalLauncher;

#[async_trait]
impl TerminalLauncher for NativeTerminalLauncher {
    async fn open_window(&self, script: &Path, title: &str) -> Result<(), SessionError> {
        let osa = format!(
            "tell application \"Terminal\"\n\
             \tactivate\n\
             \tset newTab to do script \"{}\"\n\
             \tset custom title of newTab to \"{title}\"\n\
             end tell",
            script.display()
        );
        run_osascript(&osa).await
    }
}

/// Alternate terminal emulator, same shape as the native launcher with a
/// different control script.
pub struct AlternateTerminalLauncher;

#[async_trait]
impl TerminalLauncher for AlternateTerminalLauncher {
    async fn open_window(&self, script: &Path, title: &str) -> Result<(), SessionError> {
        let osa = format!(
            "tell application \"iTerm\"\n\
             \tcreate window with default profile\n\
             \ttell current session of current window\n\
             \t\twrite text \"{}\"\n\
             \t\tset name to \"{title}\"\n\
             \tend tell\n\
             end tell",
            script.display()
        );
        run_osascript(&osa).await
    }
}

async fn run_osascript(script: &str) -> Result<(), SessionError> {
    let output = Command::new("osascript")
        .arg("-e")
        .arg(script)
        .output()
        .await
        .map_err(|e| SessionError::LaunchFailed {
            reason: format!("osascript not available: {e}"),
        })?;

    if !output.status.success() {
        return Err(SessionError::LaunchFailed {
            reason: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

pub struct SessionManager {
    tool_path: String,
    window_mode: WindowMode,
    launcher: Option<Arc<dyn TerminalLauncher>>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionManager {
    pub fn new(tool_path: impl Into<String>, window_mode: WindowMode) -> Self {
        let launcher: Option<Arc<dyn TerminalLauncher>> = if cfg!(target_os = "macos") {
            match window_mode {
                WindowMode::WindowNative => Some(Arc::new(NativeTerminalLauncher)),
                WindowMode::WindowAlt => Some(Arc::new(AlternateTerminalLauncher)),
                WindowMode::Headless => None,
            }
        } else {
            // No window control channel on this host.
            None
        };

        if launcher.is_none() && window_mode != WindowMode::Headless {
            tracing::warn!("no terminal control channel on this host, degrading to headless");
        }

        Self {
            tool_path: tool_path.into(),
            window_mode,
            launcher,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Substitute the terminal launcher (tests, exotic hosts).
    pub fn with_launcher(mut self, launcher: Arc<dyn TerminalLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Launch the tool for a task. The prompt is passed as a single
    /// argument; stdout and stderr are captured into the workspace's
    /// `logs/` directory.
    pub async fn spawn(
        &self,
        task_id: &str,
        workspace: &Path,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Session, SessionError> {
        let session_id = format!("session-{task_id}-{}", Uuid::new_v4().simple());
        let logs_dir = workspace.join("logs");
        tokio::fs::create_dir_all(&logs_dir).await?;
        let session = Session {
            session_id: session_id.clone(),
            task_id: task_id.to_string(),
            workspace: workspace.to_path_buf(),
            output_log: logs_dir.join(format!("{task_id}_output.log")),
            error_log: logs_dir.join(format!("{task_id}_error.log")),
            start_time: Instant::now(),
            pid: None,
        };

        tracing::info!(
            task_id,
            %session_id,
            mode = ?self.window_mode,
            timeout_s = timeout.as_secs(),
            "spawning tool session"
        );

        let entry = match (&self.launcher, self.window_mode) {
            (Some(launcher), WindowMode::WindowNative | WindowMode::WindowAlt) => {
                self.spawn_windowed(session, prompt, launcher.clone()).await?
            }
            _ => self.spawn_headless(session, prompt).await?,
        };

        let snapshot = entry.session.clone();
        self.sessions.lock().await.insert(session_id, entry);
        Ok(snapshot)
    }

    /// Windowed launch: synthesise a script, hand it to the launcher,
    /// discover the PID by name-matching the script path.
    async fn spawn_windowed(
        &self,
        mut session: Session,
        prompt: &str,
        launcher: Arc<dyn TerminalLauncher>,
    ) -> Result<SessionEntry, SessionError> {
        let script_path = session.workspace.join(format!("{}_run.sh", session.task_id));
        let script = render_run_script(
            &self.tool_path,
            &session.workspace,
            &session.task_id,
            prompt,
            &session.output_log,
        );
        tokio::fs::write(&script_path, script).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
                .await?;
        }

        let title = format!("Task: {}", session.task_id);
        launcher.open_window(&script_path, &title).await?;

        // The window needs a moment before the script process exists.
        tokio::time::sleep(PID_DISCOVERY_DELAY).await;
        session.pid = find_pid_by_script(&script_path).await;

        if session.pid.is_none() {
            tracing::warn!(
                task_id = %session.task_id,
                "could not discover PID of windowed session; it will read as finished"
            );
        }

        Ok(SessionEntry {
            session,
            child: None,
            exit_code: None,
        })
    }

    /// Headless launch: plain child process with redirected output.
    async fn spawn_headless(
        &self,
        mut session: Session,
        prompt: &str,
    ) -> Result<SessionEntry, SessionError> {
        let stdout = std::fs::File::create(&session.output_log)?;
        let stderr = std::fs::File::create(&session.error_log)?;

        let child = Command::new(&self.tool_path)
            .arg(prompt)
            .current_dir(&session.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| SessionError::SpawnFailed {
                reason: format!("{}: {e}", self.tool_path),
            })?;

        session.pid = child.id();
        tracing::info!(
            task_id = %session.task_id,
            pid = ?session.pid,
            "spawned headless tool process"
        );

        Ok(SessionEntry {
            session,
            child: Some(child),
            exit_code: None,
        })
    }

    /// Whether the session's process is still alive. A windowed session
    /// whose PID was never discovered reads as finished.
    pub async fn is_running(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(entry) = sessions.get_mut(session_id) else {
            return false;
        };

        if let Some(child) = entry.child.as_mut() {
            return match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    entry.exit_code = status.code();
                    false
                }
                Err(_) => false,
            };
        }

        match entry.session.pid {
            Some(pid) => pid_alive(pid),
            None => false,
        }
    }

    /// Current content of the session's output log.
    pub async fn output(&self, session_id: &str) -> String {
        self.read_log(session_id, |s| s.output_log.clone()).await
    }

    /// Current content of the session's error log.
    pub async fn error(&self, session_id: &str) -> String {
        self.read_log(session_id, |s| s.error_log.clone()).await
    }

    async fn read_log(&self, session_id: &str, pick: impl Fn(&Session) -> PathBuf) -> String {
        let path = {
            let sessions = self.sessions.lock().await;
            match sessions.get(session_id) {
                Some(entry) => pick(&entry.session),
                None => return String::new(),
            }
        };
        tokio::fs::read_to_string(&path).await.unwrap_or_default()
    }

    /// Exit code of a finished session: the reaped status for headless
    /// sessions, otherwise the code the generated script recorded under
    /// `logs/exit_code`.
    pub async fn exit_code(&self, session_id: &str) -> Option<i32> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(session_id)?;

        if entry.exit_code.is_some() {
            return entry.exit_code;
        }
        if let Some(child) = entry.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                entry.exit_code = status.code();
            }
            return entry.exit_code;
        }

        // Windowed session: the script wrote the tool's code on exit.
        let path = entry.session.workspace.join("logs").join("exit_code");
        let code = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok());
        entry.exit_code = code;
        code
    }

    /// Request termination. Graceful termination sends SIGTERM and waits up
    /// to five seconds; `force` kills immediately. A no-op for sessions
    /// that already finished.
    pub async fn terminate(&self, session_id: &str, force: bool) {
        let mut sessions = self.sessions.lock().await;
        let Some(entry) = sessions.get_mut(session_id) else {
            return;
        };

        if let Some(child) = entry.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    entry.exit_code = status.code();
                    return;
                }
                Ok(None) => {}
                Err(_) => return,
            }

            if force {
                let _ = child.kill().await;
            } else {
                if let Some(pid) = child.id() {
                    send_signal(pid, false);
                }
                match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                    Ok(Ok(status)) => entry.exit_code = status.code(),
                    Ok(Err(_)) => {}
                    Err(_) => {
                        tracing::warn!(session_id, "graceful termination timed out, killing");
                        let _ = child.kill().await;
                    }
                }
            }
            tracing::info!(session_id, "terminated session");
            return;
        }

        if let Some(pid) = entry.session.pid {
            if pid_alive(pid) {
                send_signal(pid, force);
                tracing::info!(session_id, pid, force, "signalled windowed session");
            }
        }
    }

    /// Block until the session finishes, polling once a second. Returns
    /// `false` when the deadline passes first.
    pub async fn wait(&self, session_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running(session_id).await {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(session_id, "session did not finish within {timeout:?}");
                return false;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Close a session: terminate it if still running and drop it from the
    /// table. Idempotent.
    pub async fn close(&self, session_id: &str) {
        if self.is_running(session_id).await {
            self.terminate(session_id, false).await;
        }
        if self.sessions.lock().await.remove(session_id).is_some() {
            tracing::debug!(session_id, "closed session");
        }
    }

    /// Snapshot of all registered sessions: (session_id, task_id, pid).
    pub async fn list_sessions(&self) -> Vec<(String, String, Option<u32>)> {
        self.sessions
            .lock()
            .await
            .values()
            .map(|e| {
                (
                    e.session.session_id.clone(),
                    e.session.task_id.clone(),
                    e.session.pid,
                )
            })
            .collect()
    }
}

/// Replace every single quote so the prompt survives embedding in a
/// single-quoted shell literal.
fn escape_prompt(prompt: &str) -> String {
    prompt.replace('\'', "'\"'\"'")
}

/// The script run inside a terminal window. Emits a header and footer
/// around the tool invocation, tees stdout+stderr into the output log, and
/// records the tool's own exit code under `logs/exit_code` so the agent can
/// read it back after the window closes.
fn render_run_script(
    tool_path: &str,
    workspace: &Path,
    task_id: &str,
    prompt: &str,
    output_log: &Path,
) -> String {
    let escaped = escape_prompt(prompt);
    format!(
        "#!/bin/bash\n\
         cd \"{workspace}\"\n\
         \n\
         echo \"=== Task Execution ===\"\n\
         echo \"Task ID: {task_id}\"\n\
         echo \"Started: $(date)\"\n\
         echo \"======================\"\n\
         echo \"\"\n\
         \n\
         {tool_path} '{escaped}' 2>&1 | tee \"{output_log}\"\n\
         \n\
         exit_code=${{PIPESTATUS[0]}}\n\
         echo \"$exit_code\" > \"{workspace}/logs/exit_code\"\n\
         echo \"\"\n\
         echo \"======================\"\n\
         echo \"Finished: $(date)\"\n\
         echo \"Exit code: $exit_code\"\n\
         echo \"======================\"\n\
         \n\
         sleep 2\n\
         \n\
         exit $exit_code\n",
        workspace = workspace.display(),
        output_log = output_log.display(),
    )
}

/// Discover the PID of the process running the given script.
async fn find_pid_by_script(script: &Path) -> Option<u32> {
    let output = Command::new("pgrep")
        .arg("-f")
        .arg(script.as_os_str())
        .output()
        .await
        .ok()?;
    String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// Zero-signal liveness probe.
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

/// Send SIGTERM (graceful) or SIGKILL (forced) to a bare PID.
fn send_signal(pid: u32, force: bool) {
    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;
        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal);
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, force);
    }
}
