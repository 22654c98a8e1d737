//! Device discovery, benchmarking and selection.
//!
//! [`DeviceRegistry`] ties the pieces together: a [`DeviceProbe`] lists the
//! accelerators, the [`Benchmarker`] rates the ones the [`ProfileStore`]
//! does not know yet, and selection picks the best rated device (or the
//! CPU) for the whole run.

mod benchmark;
mod probe;
mod profile;
mod registry;
mod store;

pub use benchmark::{
    Accelerator, BenchOutcome, BenchTarget, Benchmarker, CpuReference, ReferenceWorkload,
    assign_ratings,
};
#[cfg(feature = "wgpu")]
pub use probe::{WgpuAccelerator, WgpuProbe};
pub use probe::{DeviceProbe, NoAccelerators, default_probe};
pub use profile::{DeviceProfile, UNRATED_DURATION};
pub use registry::DeviceRegistry;
pub use store::ProfileStore;
