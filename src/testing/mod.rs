//! Test harness for kernels described by TOML manifests.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- fixtures/scenario_b.toml --stats
//! ```

pub mod manifest;

pub use manifest::{discover, run_dir, KernelManifest, ManifestResult};
