use serde::{Deserialize, Serialize};

/// Duration recorded for a device that has not been (or could not be)
/// measured: one week, in seconds.
pub const UNRATED_DURATION: f64 = 604_800.0;

/// Persisted performance characterization of one compute device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// `vendor/name/device` identity, stable across runs.
    pub guid: String,
    /// Execution context (graphics API) the device is reached through.
    pub context: String,
    /// `min_duration / duration`, in `(0, 1]` once rated; 0 while unrated.
    pub rating: f64,
    /// Seconds taken by the reference workload at the best block size.
    pub duration: f64,
    /// Fastest duration among every candidate when the rating was computed,
    /// the CPU reference included.
    pub min_duration: f64,
    /// Fastest block size, or 0 if none worked.
    pub block_size: u32,
    /// Usable memory in bytes.
    pub memory_size: u64,
}

impl DeviceProfile {
    /// A freshly discovered, unrated device.
    pub fn new(guid: impl Into<String>, context: impl Into<String>, memory_size: u64) -> Self {
        Self {
            guid: guid.into(),
            context: context.into(),
            rating: 0.0,
            duration: UNRATED_DURATION,
            min_duration: UNRATED_DURATION,
            block_size: 0,
            memory_size,
        }
    }

    pub fn is_rated(&self) -> bool {
        self.rating > 0.0
    }

    /// Rated and with a block size that worked.
    pub fn is_usable(&self) -> bool {
        self.is_rated() && self.block_size != 0
    }
}
