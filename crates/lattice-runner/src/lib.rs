//! Step execution engine for Lattice CI.
//!
//! [`ExecutionRunner`] implements the scheduler's `JobRunner` port: it runs
//! the steps of one job instance in order, through an `Executor` for shell
//! steps and the [`ActionRegistry`] for `uses:` steps.

pub mod actions;
pub mod logs;
pub mod retry;
pub mod runner;
pub mod shell;

pub use actions::{Action, ActionContext, ActionInputs, ActionOutput, ActionRegistry};
pub use logs::{LogStore, OutputLine, OutputStream};
pub use retry::{Retried, RetryPolicy};
pub use runner::{ExecutionRunner, RunnerConfig};
pub use shell::ShellExecutor;
