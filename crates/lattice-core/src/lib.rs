//! Lattice CI Core
//!
//! Core domain types, traits, and error handling for Lattice CI.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler, the runner, the artifact broker and the CLI.

pub mod artifact;
pub mod error;
pub mod ids;
pub mod interpolation;
pub mod job;
pub mod pipeline;
pub mod ports;
pub mod run;

pub use error::{Error, Result};
pub use ids::*;
