//! Empirical device rating.
//!
//! Every unrated device runs the reference workload
//! `c = 1.7159 * tanh(0.6666 * (a x b^T + bias))` at each candidate block
//! size. The CPU runs it once in double precision; that result is the
//! numeric reference and its time is a rating floor, so a device slower
//! than the CPU rates below 1 even if it is the only accelerator.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{DeviceProfile, UNRATED_DURATION};
use crate::approx::divergence;
use crate::backend::{CPU_GUID, Device};
use crate::config::{DeviceConfig, DivergenceAction, ReferenceShape};
use crate::error::{FlowError, FlowResult};
use crate::ops::cpu;

/// Input data of the reference workload.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceWorkload {
    pub shape: ReferenceShape,
    /// `[a_height, ab_width]`
    pub a: Vec<f64>,
    /// `[b_height, ab_width]`
    pub b: Vec<f64>,
    /// `[b_height]`
    pub bias: Vec<f64>,
}

impl ReferenceWorkload {
    /// Uniform values in `[-0.5, 0.5)`, reproducible from `seed`.
    pub fn generate(shape: ReferenceShape, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut fill = |n: usize| -> Vec<f64> { (0..n).map(|_| rng.gen_range(-0.5..0.5)).collect() };
        let a = fill(shape.a_height * shape.ab_width);
        let b = fill(shape.b_height * shape.ab_width);
        let bias = fill(shape.b_height);
        Self { shape, a, b, bias }
    }
}

/// Time and result of one run of the reference workload.
#[derive(Debug, Clone)]
pub struct BenchOutcome {
    pub elapsed: Duration,
    /// `[a_height, b_height]`
    pub output: Vec<f64>,
}

/// Anything that can run the reference workload.
pub trait BenchTarget {
    fn guid(&self) -> &str;

    /// Runs the workload with `block_size` tiles. An unsupported block size
    /// fails with [`FlowError::UnsupportedBackendConfiguration`].
    fn run_reference(&self, workload: &ReferenceWorkload, block_size: u32) -> FlowResult<BenchOutcome>;
}

/// A discovered accelerator.
pub trait Accelerator: BenchTarget {
    /// Execution context the device belongs to.
    fn context(&self) -> &str;

    /// Usable memory in bytes.
    fn memory_size(&self) -> u64;

    /// Activates the device's execution context for this process.
    fn open(&self) -> FlowResult<Device>;
}

/// The CPU in double precision; ignores the block size.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuReference;

impl BenchTarget for CpuReference {
    fn guid(&self) -> &str {
        CPU_GUID
    }

    fn run_reference(&self, workload: &ReferenceWorkload, _block_size: u32) -> FlowResult<BenchOutcome> {
        let start = Instant::now();
        let output = cpu::feed_tanh(&workload.a, &workload.b, &workload.bias, workload.shape.ab_width);
        Ok(BenchOutcome {
            elapsed: start.elapsed(),
            output,
        })
    }
}

/// Rates devices against each other and the CPU.
pub struct Benchmarker {
    config: DeviceConfig,
    cpu: Box<dyn BenchTarget>,
}

impl Benchmarker {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            cpu: Box::new(CpuReference),
        }
    }

    /// Replaces the CPU reference target.
    pub fn with_cpu(mut self, cpu: Box<dyn BenchTarget>) -> Self {
        self.cpu = cpu;
        self
    }

    /// Measures every unrated profile that has a matching accelerator and
    /// recomputes all ratings. Returns whether anything was measured.
    pub fn benchmark(
        &self,
        profiles: &mut [DeviceProfile],
        accelerators: &[Box<dyn Accelerator>],
    ) -> FlowResult<bool> {
        let pending: Vec<usize> = profiles
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_rated() && accelerators.iter().any(|a| a.guid() == p.guid))
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            debug!("every device is rated");
            return Ok(false);
        }

        let workload = ReferenceWorkload::generate(self.config.reference, self.config.seed);
        let reference = self.cpu.run_reference(&workload, 0)?;
        let cpu_duration = reference.elapsed.as_secs_f64();
        info!("cpu reference: {cpu_duration:.6} s");

        for i in pending {
            let profile = &mut profiles[i];
            let Some(device) = accelerators.iter().find(|a| a.guid() == profile.guid) else {
                continue;
            };
            match self.best_block_size(device.as_ref(), &workload, &reference.output) {
                Some((block_size, elapsed)) => {
                    info!("{}: block size {block_size}, {elapsed:.6} s", profile.guid);
                    profile.block_size = block_size;
                    profile.duration = elapsed;
                }
                None => {
                    warn!("{}: no candidate block size works", profile.guid);
                    profile.block_size = 0;
                    profile.duration = UNRATED_DURATION;
                }
            }
        }

        assign_ratings(profiles, cpu_duration);
        Ok(true)
    }

    /// Fastest accepted `(block_size, seconds)` of `device`.
    fn best_block_size(
        &self,
        device: &dyn Accelerator,
        workload: &ReferenceWorkload,
        reference: &[f64],
    ) -> Option<(u32, f64)> {
        let policy = self.config.divergence;
        let mut best: Option<(u32, f64)> = None;

        for &block_size in &self.config.block_sizes {
            let outcome = match device.run_reference(workload, block_size) {
                Ok(outcome) => outcome,
                Err(e @ FlowError::UnsupportedBackendConfiguration { .. }) => {
                    warn!("{e}");
                    continue;
                }
                Err(e) => {
                    warn!("{}: block size {block_size} failed: {e}", device.guid());
                    continue;
                }
            };
            let elapsed = outcome.elapsed.as_secs_f64();

            let Some(diff) = divergence(&outcome.output, reference) else {
                warn!(
                    "{}: block size {block_size} produced {} values, expected {}",
                    device.guid(),
                    outcome.output.len(),
                    reference.len()
                );
                continue;
            };
            debug!(
                "{}: block size {block_size}: {elapsed:.6} s, mean diff {:.3e}, max diff {:.3e}",
                device.guid(),
                diff.mean_diff,
                diff.max_diff
            );
            if diff.relative > policy.tolerance {
                let e = FlowError::NumericDivergence {
                    device: device.guid().to_string(),
                    block_size,
                    max_diff: diff.max_diff,
                    tolerance: policy.tolerance,
                };
                warn!("{e}");
                if policy.action == DivergenceAction::Reject {
                    continue;
                }
            }

            if best.is_none_or(|(_, t)| elapsed < t) {
                best = Some((block_size, elapsed));
            }
        }
        best
    }
}

/// `rating = min_duration / duration`, where `min_duration` is the fastest
/// of `cpu_duration` and every profile's duration.
pub fn assign_ratings(profiles: &mut [DeviceProfile], cpu_duration: f64) {
    let min_duration = profiles
        .iter()
        .map(|p| p.duration)
        .fold(cpu_duration, f64::min);
    for profile in profiles.iter_mut() {
        profile.min_duration = min_duration;
        profile.rating = if profile.duration > 0.0 {
            min_duration / profile.duration
        } else {
            1.0
        };
    }
}
