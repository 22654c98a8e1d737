//! # Backend implementations
//!
//! - [`cpu`]: sequential reference kernels (always available)
//! - [`wgpu`] *(opt-in)*: compute shader pipelines using `wgpu`
//! - [`dispatch`]: the [`AcceleratedUnit`](dispatch::AcceleratedUnit)
//!   contract and the wrapper that picks a backend per unit
//!
//! ## Adding an accelerated unit
//!
//! 1. Write the sequential kernel in `cpu`
//! 2. Write the shader under `wgpu/shaders` and its host side in `wgpu`
//! 3. Implement `AcceleratedUnit` and wrap the unit in `Accelerated`
//! 4. Add an equivalence test comparing both paths within tolerance
//!
//! ## Feature Flags
//!
//! - `wgpu`: Enables the `wgpu` (WebGPU) backend

pub mod cpu;
pub mod dispatch;
#[cfg(feature = "wgpu")]
pub mod wgpu;
