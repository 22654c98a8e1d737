//! Backend selection.
//!
//! This module defines the available computation backends and the
//! process-wide [`Device`] handle every unit is initialized against.
//!
//! # Supported Backends
//!
//! - `Cpu`: Pure Rust sequential implementations (default, always present).
//! - `Wgpu`: Compute shaders through `wgpu` (feature `wgpu`).
//!
//! Unlike a global backend switch, the device is chosen once by the
//! [`DeviceRegistry`](crate::device::DeviceRegistry) and handed to
//! [`Graph::initialize`](crate::graph::Graph::initialize). A unit records the
//! backend it was initialized for and keeps using it for every pass.

#[cfg(feature = "wgpu")]
use std::sync::Arc;

#[cfg(feature = "wgpu")]
use crate::ops::wgpu::GpuContext;

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// Pure CPU-based backend (default).
    #[default]
    Cpu,
    /// GPU-accelerated backend using `wgpu`.
    Wgpu,
}

/// The device selected for a run.
///
/// Cloning is cheap; all clones of an accelerator device share one context.
#[derive(Clone, Default)]
pub enum Device {
    #[default]
    Cpu,
    #[cfg(feature = "wgpu")]
    Wgpu(Arc<GpuContext>),
}

/// Identity reported for the CPU fallback.
pub const CPU_GUID: &str = "cpu";

impl Device {
    pub fn backend(&self) -> Backend {
        match self {
            Self::Cpu => Backend::Cpu,
            #[cfg(feature = "wgpu")]
            Self::Wgpu(_) => Backend::Wgpu,
        }
    }

    /// Stable identity of the device, as used in the profile store.
    pub fn guid(&self) -> &str {
        match self {
            Self::Cpu => CPU_GUID,
            #[cfg(feature = "wgpu")]
            Self::Wgpu(ctx) => &ctx.guid,
        }
    }

    pub fn is_accelerator(&self) -> bool {
        self.backend() != Backend::Cpu
    }

    #[cfg(feature = "wgpu")]
    pub fn gpu(&self) -> Option<&Arc<GpuContext>> {
        match self {
            Self::Wgpu(ctx) => Some(ctx),
            Self::Cpu => None,
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Device({:?}, {})", self.backend(), self.guid())
    }
}
