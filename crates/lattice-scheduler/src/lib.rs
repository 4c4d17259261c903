//! Matrix expansion, dependency graph and job scheduling for Lattice CI.

pub mod dag;
pub mod matrix;
pub mod queue;
pub mod report;
pub mod scheduler;

pub use dag::{DagBuilder, DagNode, JobDag};
pub use matrix::MatrixExpander;
pub use queue::{QueuedJob, ReadyQueue};
pub use report::finalize;
pub use scheduler::{Scheduler, SchedulerConfig};
