use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use zephyr_executor::cli::{self, Cli, Command};

/// Log to stdout and to a single rolling file under the agent's state
/// directory, owner-readable only. The guard must live for the whole run.
fn init_logging() -> std::io::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".zephyr-executor");
    std::fs::create_dir_all(&log_dir)?;

    let mut open_opts = std::fs::OpenOptions::new();
    open_opts.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        open_opts.mode(0o600);
    }
    let log_file = open_opts.open(log_dir.join("zephyr-executor.log"))?;
    let (file_writer, guard) = tracing_appender::non_blocking(log_file);

    let env_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("zephyr_executor=info"))
    };

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(env_filter());
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(env_filter());

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_logging() {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("warning: could not open log file: {e}");
            None
        }
    };

    let code = match cli.command {
        Some(Command::Login {
            token,
            refresh_token,
        }) => cli::login(&token, refresh_token.as_deref()).await,
        Some(Command::Logout) => cli::logout().await,
        Some(Command::Whoami) => cli::whoami().await,
        None => cli::run_agent().await,
    };

    ExitCode::from(code)
}
