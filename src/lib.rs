//! Agent worker that leases tasks from an orchestrator and executes them
//! either through a language-model HTTP API or by driving an external
//! command-line tool inside an isolated per-task workspace.

pub mod auth;
pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod orchestrator;
pub mod session;
pub mod task;
pub mod workspace;

pub use config::ExecutorConfig;
pub use executor::Executor;
pub use task::{ExecutionMode, ExecutionResult, TaskDescriptor};
