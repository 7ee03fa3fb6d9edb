//! Executor configuration, loaded from environment variables.
//!
//! A `.env` file in the working directory is honoured for local development;
//! real deployments set the variables directly.

use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::task::ExecutionMode;

/// How the external tool is presented when running in process mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Visible window in the host's native terminal application.
    WindowNative,
    /// Visible window in the alternate terminal emulator.
    WindowAlt,
    /// Plain child process, no window.
    Headless,
}

/// Complete executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    // Orchestrator
    pub orchestrator_url: String,

    // Identity provider
    pub identity_url: String,
    pub identity_anon_key: SecretString,

    // Model API
    pub model_api_key: SecretString,
    pub model_name: String,

    // Agent
    pub agent_name: String,
    pub max_concurrent_tasks: usize,
    pub poll_interval_seconds: u64,
    pub max_tokens_per_request: u32,
    pub task_timeout_seconds: u64,
    pub execution_mode: ExecutionMode,

    // Process execution
    pub external_tool_path: String,
    pub window_mode: WindowMode,
    pub workspace_base: PathBuf,
    pub auto_cleanup_workspaces: bool,
    pub workspace_max_age_hours: u64,
}

impl ExecutorConfig {
    /// Load configuration from the environment.
    ///
    /// Returns `ConfigError::MissingVar` listing every absent required
    /// variable at once, so the operator fixes them in one pass.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Best effort; absence of a .env file is not an error.
        let _ = dotenvy::dotenv();

        let mut missing = Vec::new();
        let orchestrator_url = require("ORCHESTRATOR_URL", &mut missing);
        let identity_url = require("IDENTITY_URL", &mut missing);
        let identity_anon_key = require("IDENTITY_ANON_KEY", &mut missing);
        let model_api_key = require("MODEL_API_KEY", &mut missing);
        if !missing.is_empty() {
            return Err(ConfigError::MissingVar(missing.join(", ")));
        }

        let workspace_base = match std::env::var("WORKSPACE_BASE") {
            Ok(v) => PathBuf::from(v),
            Err(_) => default_workspace_base(),
        };

        let config = Self {
            orchestrator_url: orchestrator_url.trim_end_matches('/').to_string(),
            identity_url: identity_url.trim_end_matches('/').to_string(),
            identity_anon_key: SecretString::from(identity_anon_key),
            model_api_key: SecretString::from(model_api_key),
            model_name: var_or("MODEL_NAME", "claude-sonnet-4"),
            agent_name: var_or("AGENT_NAME", "zephyr-executor-1"),
            max_concurrent_tasks: parse_var("MAX_CONCURRENT_TASKS", 2)?,
            poll_interval_seconds: parse_var("POLL_INTERVAL_SECONDS", 30)?,
            max_tokens_per_request: parse_var("MAX_TOKENS_PER_REQUEST", 4096)?,
            task_timeout_seconds: parse_var("TASK_TIMEOUT_SECONDS", 600)?,
            execution_mode: parse_mode("EXECUTION_MODE")?,
            external_tool_path: var_or("EXTERNAL_TOOL_PATH", "claude"),
            window_mode: parse_window_mode("WINDOW_MODE")?,
            workspace_base,
            auto_cleanup_workspaces: parse_var("AUTO_CLEANUP_WORKSPACES", true)?,
            workspace_max_age_hours: parse_var("WORKSPACE_MAX_AGE_HOURS", 24)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values. Called at startup; a failure is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks < 1 || self.max_concurrent_tasks > 10 {
            return Err(ConfigError::OutOfRange {
                key: "MAX_CONCURRENT_TASKS".into(),
                reason: format!("{} not in 1..=10", self.max_concurrent_tasks),
            });
        }
        if self.poll_interval_seconds < 5 {
            return Err(ConfigError::OutOfRange {
                key: "POLL_INTERVAL_SECONDS".into(),
                reason: format!("{} is below the 5s minimum", self.poll_interval_seconds),
            });
        }
        if self.max_tokens_per_request < 100 {
            return Err(ConfigError::OutOfRange {
                key: "MAX_TOKENS_PER_REQUEST".into(),
                reason: format!("{} is below the 100 minimum", self.max_tokens_per_request),
            });
        }
        if self.task_timeout_seconds == 0 {
            return Err(ConfigError::OutOfRange {
                key: "TASK_TIMEOUT_SECONDS".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Default workspace base: `~/.zephyr-executor/workspaces`.
pub fn default_workspace_base() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".zephyr-executor")
        .join("workspaces")
}

fn require(key: &'static str, missing: &mut Vec<&'static str>) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => {
            missing.push(key);
            String::new()
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_var<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v.parse().map_err(|e: T::Err| ConfigError::Parse {
            key: key.into(),
            reason: e.to_string(),
        }),
        _ => Ok(default),
    }
}

fn parse_mode(key: &'static str) -> Result<ExecutionMode, ConfigError> {
    match std::env::var(key).ok().filter(|v| !v.is_empty()) {
        None => Ok(ExecutionMode::Api),
        Some(v) => match v.as_str() {
            "api" => Ok(ExecutionMode::Api),
            "process" => Ok(ExecutionMode::Process),
            other => Err(ConfigError::Parse {
                key: key.into(),
                reason: format!("unknown execution mode '{other}' (expected api or process)"),
            }),
        },
    }
}

fn parse_window_mode(key: &'static str) -> Result<WindowMode, ConfigError> {
    match std::env::var(key).ok().filter(|v| !v.is_empty()) {
        None => Ok(WindowMode::Headless),
        Some(v) => match v.as_str() {
            "window_native" => Ok(WindowMode::WindowNative),
            "window_alt" => Ok(WindowMode::WindowAlt),
            "headless" => Ok(WindowMode::Headless),
            other => Err(ConfigError::Parse {
                key: key.into(),
                reason: format!(
                    "unknown window mode '{other}' (expected window_native, window_alt or headless)"
                ),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ExecutorConfig {
        ExecutorConfig {
            orchestrator_url: "http://localhost:3000".into(),
            identity_url: "http://localhost:9999".into(),
            identity_anon_key: SecretString::from("anon"),
            model_api_key: SecretString::from("key"),
            model_name: "claude-sonnet-4".into(),
            agent_name: "zephyr-executor-1".into(),
            max_concurrent_tasks: 2,
            poll_interval_seconds: 30,
            max_tokens_per_request: 4096,
            task_timeout_seconds: 600,
            execution_mode: ExecutionMode::Api,
            external_tool_path: "claude".into(),
            window_mode: WindowMode::Headless,
            workspace_base: PathBuf::from("/tmp/ws"),
            auto_cleanup_workspaces: true,
            workspace_max_age_hours: 24,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn concurrency_bounds_enforced() {
        let mut config = test_config();
        config.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());
        config.max_concurrent_tasks = 11;
        assert!(config.validate().is_err());
        config.max_concurrent_tasks = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn poll_interval_minimum_enforced() {
        let mut config = test_config();
        config.poll_interval_seconds = 4;
        assert!(config.validate().is_err());
        config.poll_interval_seconds = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn token_minimum_enforced() {
        let mut config = test_config();
        config.max_tokens_per_request = 99;
        assert!(config.validate().is_err());
    }
}
