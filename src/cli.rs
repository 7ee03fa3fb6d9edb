//! Command-line interface: the agent run loop plus the auth subcommands.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::auth::{AuthConfig, AuthTokenStore};
use crate::backend::{ModelApiBackend, ProcessExecBackend};
use crate::config::ExecutorConfig;
use crate::executor::Executor;
use crate::monitor::ProcessMonitor;
use crate::orchestrator::OrchestratorClient;
use crate::session::SessionManager;
use crate::workspace::WorkspaceManager;

const CYAN: &str = "\x1b[36m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Interval between status printouts while the agent runs.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(
    name = "zephyr-executor",
    version,
    about = "Agent worker that leases and executes orchestrator tasks"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Store an access token obtained from the identity provider
    Login {
        /// Access token to install
        #[arg(long)]
        token: String,
        /// Optional refresh token for automatic renewal
        #[arg(long)]
        refresh_token: Option<String>,
    },
    /// Clear the cached session
    Logout,
    /// Show the currently authenticated user
    Whoami,
}

fn banner() {
    println!(
        "{CYAN}╔═══════════════════════════════════════════════════════╗\n\
         ║                 Zephyr Executor                       ║\n\
         ║           Local AI Task Execution Agent               ║\n\
         ╚═══════════════════════════════════════════════════════╝{RESET}"
    );
}

fn status_line(color: &str, message: &str) {
    println!("{color}► {message}{RESET}");
}

/// Wire up every component from a loaded configuration.
fn build_executor(config: &ExecutorConfig) -> (Executor, Arc<WorkspaceManager>) {
    let auth = Arc::new(AuthTokenStore::new(AuthConfig::new(
        config.identity_url.clone(),
        config.identity_anon_key.clone(),
    )));
    let client = Arc::new(OrchestratorClient::new(
        config.orchestrator_url.clone(),
        auth,
    ));
    let api_backend = Arc::new(ModelApiBackend::new(
        config.model_api_key.clone(),
        config.model_name.clone(),
        config.max_tokens_per_request,
    ));

    let workspaces = Arc::new(WorkspaceManager::new(
        config.workspace_base.clone(),
        serde_json::json!({
            "model": config.model_name,
            "max_tokens": config.max_tokens_per_request,
        }),
    ));
    let sessions = Arc::new(SessionManager::new(
        config.external_tool_path.clone(),
        config.window_mode,
    ));
    let process_backend = Arc::new(ProcessExecBackend::new(
        Arc::clone(&workspaces),
        sessions,
        Arc::new(ProcessMonitor::new()),
        Duration::from_secs(config.task_timeout_seconds),
        config.auto_cleanup_workspaces,
    ));

    let executor = Executor::new(config.clone(), client, api_backend, process_backend);
    (executor, workspaces)
}

async fn print_stats(executor: &Executor) {
    let status = executor.status().await;
    let state = if status.running {
        format!("{GREEN}Running{RESET}")
    } else {
        format!("{RED}Stopped{RESET}")
    };

    println!("\n{CYAN}═══ Statistics ═══{RESET}");
    println!("  Status: {state}");
    println!("  Active Tasks: {}", status.active_tasks);
    println!("  Queued Tasks: {}", status.queued_tasks);
    println!("  Total Tasks: {}", status.stats.total);
    println!("  Completed: {GREEN}{}{RESET}", status.stats.completed);
    println!("  Failed: {RED}{}{RESET}", status.stats.failed);
    println!("  Total Tokens: {}", status.stats.total_tokens);
    if status.stats.total > 0 {
        let rate = status.stats.completed as f64 / status.stats.total as f64 * 100.0;
        println!("  Success Rate: {rate:.1}%");
    }
    println!();
}

/// Run the agent until interrupted. Returns the process exit code.
pub async fn run_agent() -> u8 {
    banner();

    status_line(CYAN, "Loading configuration...");
    let config = match ExecutorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            status_line(RED, &format!("Configuration error: {e}"));
            return 1;
        }
    };
    status_line(
        GREEN,
        &format!("Configuration loaded (agent: {})", config.agent_name),
    );

    let (executor, workspaces) = build_executor(&config);

    let reaped = workspaces.reap_older_than(config.workspace_max_age_hours);
    if reaped > 0 {
        status_line(YELLOW, &format!("Reclaimed {reaped} stale workspace(s)"));
    }

    status_line(CYAN, "Starting executor...");
    if let Err(e) = executor.start().await {
        status_line(RED, &format!("Failed to start: {e}"));
        return 1;
    }
    status_line(GREEN, "Executor is running and polling for tasks");
    println!("{CYAN}  Press Ctrl+C to stop{RESET}\n");

    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.tick().await; // immediate first tick is skipped
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                status_line(YELLOW, "Received interrupt, shutting down...");
                break;
            }
            _ = stats_tick.tick() => {
                print_stats(&executor).await;
            }
        }
    }

    executor.stop().await;
    print_stats(&executor).await;
    status_line(GREEN, "Executor stopped");
    0
}

fn auth_store_from_env() -> Result<AuthTokenStore, u8> {
    let config = ExecutorConfig::from_env().map_err(|e| {
        status_line(RED, &format!("Configuration error: {e}"));
        1u8
    })?;
    Ok(AuthTokenStore::new(AuthConfig::new(
        config.identity_url,
        config.identity_anon_key,
    )))
}

pub async fn login(token: &str, refresh_token: Option<&str>) -> u8 {
    let auth = match auth_store_from_env() {
        Ok(auth) => auth,
        Err(code) => return code,
    };

    match auth.login_with_token(token, refresh_token).await {
        Ok(user) => {
            status_line(GREEN, "Login successful");
            println!("Logged in as: {}", user.email.as_deref().unwrap_or("unknown"));
            println!("User ID: {}", user.id);
            0
        }
        Err(e) => {
            status_line(RED, &format!("Login failed: {e}"));
            1
        }
    }
}

pub async fn logout() -> u8 {
    let auth = match auth_store_from_env() {
        Ok(auth) => auth,
        Err(code) => return code,
    };
    auth.logout().await;
    status_line(GREEN, "Logged out");
    0
}

pub async fn whoami() -> u8 {
    let auth = match auth_store_from_env() {
        Ok(auth) => auth,
        Err(code) => return code,
    };

    match auth.whoami().await {
        Some(user) => {
            println!("\n{GREEN}Authenticated as:{RESET}");
            println!("  Email: {}", user.email.as_deref().unwrap_or("unknown"));
            println!("  User ID: {}\n", user.id);
            0
        }
        None => {
            println!("{YELLOW}Not logged in{RESET}");
            println!("Run: zephyr-executor login --token <token>");
            1
        }
    }
}
