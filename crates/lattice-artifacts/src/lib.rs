//! Content-addressed artifact broker for Lattice CI.

pub mod broker;
pub mod export;
pub mod keys;

pub use broker::{ArtifactBroker, RetentionPolicy};
pub use export::{ExportedArtifact, MANIFEST_FILE};
pub use keys::{content_digest, glob_to_regex, sanitize_key};
