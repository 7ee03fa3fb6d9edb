//! Error types for the executor.

/// Configuration errors. Fatal at startup, never at runtime.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is not set.
    #[error("missing required environment variable(s): {0}")]
    MissingVar(String),

    /// A value parsed but falls outside its allowed range.
    #[error("invalid value for {key}: {reason}")]
    OutOfRange { key: String, reason: String },

    /// A value could not be parsed at all.
    #[error("could not parse {key}: {reason}")]
    Parse { key: String, reason: String },
}

/// Authentication errors. These collapse to "not authenticated" for callers;
/// the agent keeps running and the orchestrator rejects its requests.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No usable session in memory, on disk, or via refresh.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The identity provider rejected or failed the request.
    #[error("identity provider request failed: {reason}")]
    ProviderRequest { reason: String },

    /// The cached session file could not be read or parsed.
    #[error("session cache unusable: {reason}")]
    CacheUnusable { reason: String },

    /// I/O error while reading or writing the session cache.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the orchestrator HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Transport-level failure (connect, DNS, deadline).
    #[error("request to orchestrator failed: {reason}")]
    Transport { reason: String },

    /// Non-2xx status from the orchestrator.
    #[error("orchestrator returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Errors from the language-model vendor API.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Request could not be sent or timed out.
    #[error("model API request failed: {reason}")]
    RequestFailed { reason: String },

    /// The vendor rejected our credentials.
    #[error("model API authentication failed")]
    AuthFailed,

    /// Non-2xx status carrying a vendor error message.
    #[error("model API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Response body did not match the expected shape.
    #[error("invalid model API response: {reason}")]
    InvalidResponse { reason: String },
}

/// Errors from workspace creation, population, and reclamation.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// Workspace directory could not be created.
    #[error("failed to create workspace: {0}")]
    Create(std::io::Error),

    /// A task file could not be materialised into the input tree.
    #[error("failed to write input file {path}: {source}")]
    WriteInput {
        path: String,
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the process session manager.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The external tool could not be started.
    #[error("failed to spawn external tool: {reason}")]
    SpawnFailed { reason: String },

    /// The host terminal application refused the launch request.
    #[error("terminal launch failed: {reason}")]
    LaunchFailed { reason: String },

    /// I/O error on the session's log files or generated script.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the executor core itself.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// A startup connectivity probe failed; the executor refuses to start.
    #[error("startup probe failed: {service}: {reason}")]
    StartupProbe { service: String, reason: String },

    /// `start()` called while already running.
    #[error("executor is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Config(#[from] ConfigError),
}
