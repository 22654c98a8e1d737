//! Error types shared by every part of the engine.
//!
//! Configuration and shape errors abort a run before (or at) the failing unit
//! and are never retried. Device-level conditions (`UnsupportedBackendConfiguration`,
//! `NumericDivergence`, `DeviceUnavailable`) are produced by the device registry,
//! which handles them locally; they never reach unit logic.

use thiserror::Error;

/// Every failure the engine can report.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A demanded input attribute was still unbound at initialize time.
    #[error("unit `{unit}` demands attribute `{attr}` but it is not bound")]
    Configuration { unit: String, attr: String },

    /// Bound attributes have incompatible sizes.
    #[error("shape mismatch in `{unit}`: {detail}")]
    ShapeMismatch { unit: String, detail: String },

    /// A device rejected a candidate block size during benchmarking.
    #[error("device `{device}` does not support block size {block_size}: {reason}")]
    UnsupportedBackendConfiguration {
        device: String,
        block_size: u32,
        reason: String,
    },

    /// Accelerator output disagreed with the CPU reference beyond tolerance.
    #[error(
        "device `{device}` (block size {block_size}) diverged from the CPU reference: max diff {max_diff:.6} > {tolerance:.6}"
    )]
    NumericDivergence {
        device: String,
        block_size: u32,
        max_diff: f64,
        tolerance: f64,
    },

    /// No accelerator could be found or opened.
    #[error("no accelerator available: {0}")]
    DeviceUnavailable(String),

    /// The graph is wired incorrectly.
    #[error("graph error: {0}")]
    Graph(String),

    /// A unit failed while running; the current pass was aborted.
    #[error("unit `{unit}` failed: {source}")]
    Unit {
        unit: String,
        #[source]
        source: Box<FlowError>,
    },

    /// Accelerator API failure while executing a unit.
    #[error("gpu failure: {0}")]
    Gpu(String),

    /// A checkpoint file is malformed or does not match the graph.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] bincode::Error),

    #[error(transparent)]
    Config(#[from] toml::de::Error),
}

impl FlowError {
    /// Shorthand for a [`FlowError::ShapeMismatch`].
    pub fn shape(unit: &str, detail: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            unit: unit.to_string(),
            detail: detail.into(),
        }
    }

    /// Whether the error came from graph wiring or attribute binding, i.e. it
    /// is raised before any device work happens.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::Graph(_))
    }
}

pub type FlowResult<T> = Result<T, FlowError>;
