//! Tasksmith - scoped task runner for AI coding agents
//!
//! Runs markdown task files through an agent in bounded iterations, with every
//! change checked against the task's declared scope, validated, and committed.
//!
//! # Architecture
//!
//! - [`config`] - Layered `tasksmith.toml` loading, substitution and secret scan
//! - [`error`] - `TaskError` and the failure taxonomy that drives retry policy
//! - [`scope`] - Scope guard over allowed / forbidden path patterns
//! - [`quality`] - Validation commands run before commit and push
//! - [`provider`] - Agent adapters (Claude CLI, HTTP) and output classification
//! - [`vcs`] - Narrow git interface used by the executor
//! - [`task`] - Task markdown parsing and status persistence
//! - [`context`] - Project context loading for prompts
//! - [`notify`] - Best-effort run notifications
//! - [`executor`] - Single-task run: PreFlight, iteration loop, PostFlight
//! - [`parallel`] - Dependency detection, waves and the coordinated run
//! - [`testing`] - Mocks and fixtures for every collaborator
//!
//! # Example
//!
//! ```rust,ignore
//! use tasksmith::config::ConfigLoader;
//! use tasksmith::executor::{ExecutorDependencies, TaskExecutor};
//!
//! let raw = ConfigLoader::new().load(project_dir)?;
//! let result = TaskExecutor::new(project_dir, raw, ExecutorDependencies::real(project_dir))
//!     .run(Path::new("tasks/add-health.md"))
//!     .await;
//! println!("{:?} after {} iterations", result.status, result.iterations);
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod notify;
pub mod parallel;
pub mod provider;
pub mod quality;
pub mod scope;
pub mod task;
pub mod testing;
pub mod vcs;

// Re-export commonly used types
pub use error::{ErrorCategory, ErrorCode, FailurePolicy, Result, TaskError};

pub use config::{ConfigLoader, RunnerConfig};

pub use executor::{
    ExecutorCallbacks, ExecutorDependencies, ExecutorOptions, ExecutorResult, RunState, RunStatus,
    TaskExecutor, TerminationReason,
};

pub use parallel::{
    detect_dependencies, partition_waves, Dependency, ExecutorRunner, ParallelCoordinator,
    ParallelExecutionResult, TaskRunner, TaskScope,
};

pub use task::{BlockedStatus, TaskSpec};
