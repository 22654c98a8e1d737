//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! [devices]
//! cpu_only = false
//! profile_store = "cache/device_profiles.bin"
//! block_sizes = [64, 32, 16, 8]
//!
//! [devices.divergence]
//! tolerance = 1e-3
//! action = "warn"
//!
//! [completion]
//! max_passes = 50000
//! snapshot_frequency = 500
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FlowResult;

/// Top level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub devices: DeviceConfig,
    pub completion: CompletionConfig,
}

impl EngineConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(source: &str) -> FlowResult<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> FlowResult<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }
}

/// Device discovery, benchmarking and selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Skip accelerator discovery entirely.
    pub cpu_only: bool,
    /// Where device ratings are persisted between runs.
    pub profile_store: PathBuf,
    /// Candidate block (tile) sizes, tried in order.
    pub block_sizes: Vec<u32>,
    /// Shape of the reference workload.
    pub reference: ReferenceShape,
    /// Seed for the reference workload data.
    pub seed: u64,
    pub divergence: DivergencePolicy,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            cpu_only: false,
            profile_store: PathBuf::from("cache/device_profiles.bin"),
            block_sizes: vec![64, 32, 16, 8],
            reference: ReferenceShape::default(),
            seed: 0x5eed,
            divergence: DivergencePolicy::default(),
        }
    }
}

/// `C[a_height, b_height] = tanh(A[a_height, ab_width] x B[b_height, ab_width]^T + bias)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceShape {
    pub a_height: usize,
    pub ab_width: usize,
    pub b_height: usize,
}

impl Default for ReferenceShape {
    fn default() -> Self {
        Self {
            a_height: 512,
            ab_width: 1024,
            b_height: 1024,
        }
    }
}

/// What to do when an accelerator disagrees with the CPU reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DivergencePolicy {
    /// Largest accepted `max|gpu - cpu| / max(1, max|cpu|)`.
    pub tolerance: f64,
    pub action: DivergenceAction,
}

impl Default for DivergencePolicy {
    fn default() -> Self {
        Self {
            tolerance: 1e-3,
            action: DivergenceAction::Warn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DivergenceAction {
    /// Log and keep the measurement.
    #[default]
    Warn,
    /// Log and discard the candidate block size.
    Reject,
}

/// Settings of the completion node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Passes per session before the completion signal is released.
    pub max_passes: u64,
    /// Write a checkpoint every this many total passes (0 disables).
    pub snapshot_frequency: u64,
    /// Directory for checkpoints; `None` disables them.
    pub snapshot_dir: Option<PathBuf>,
    /// Total passes before improvement checkpoints are considered.
    pub improvement_warmup: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            max_passes: 50_000,
            snapshot_frequency: 500,
            snapshot_dir: None,
            improvement_warmup: 500,
        }
    }
}
