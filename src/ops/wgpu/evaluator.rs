//! Evaluator kernels on the accelerator.
//!
//! Each kernel object is created by the unit's `gpu_init` for one shape and
//! holds the device-resident buffers of that unit; nothing here is shared
//! between units except the cached pipelines.

use std::sync::Arc;

use super::{GpuContext, KernelParams};
use crate::error::FlowResult;
use crate::ops::cpu::SoftmaxStats;

const EVALUATOR_SOFTMAX: &str = include_str!("shaders/evaluator_softmax.wgsl");
const EVALUATOR_MSE: &str = include_str!("shaders/evaluator_mse.wgsl");
const MSE_FIND_CLOSEST: &str = include_str!("shaders/mse_find_closest.wgsl");

/// Threads of the single evaluator workgroup for a batch capacity.
pub fn evaluator_block_size(batch: usize, cap: usize) -> u32 {
    batch.max(1).next_power_of_two().min(cap) as u32
}

pub struct SoftmaxKernel {
    pipeline: Arc<wgpu::ComputePipeline>,
    bind_group: wgpu::BindGroup,
    params: wgpu::Buffer,
    output: wgpu::Buffer,
    labels: wgpu::Buffer,
    err_output: wgpu::Buffer,
    confusion: wgpu::Buffer,
    n_err: wgpu::Buffer,
    max_err: wgpu::Buffer,
    batch: usize,
    y: usize,
}

impl SoftmaxKernel {
    pub fn new(ctx: &GpuContext, batch: usize, y: usize) -> FlowResult<Self> {
        let block_size = evaluator_block_size(batch, 256);
        let pipeline = ctx.program(
            "evaluator_softmax",
            &[("BLOCK_SIZE", block_size), ("BATCH", batch as u32), ("Y", y as u32)],
            EVALUATOR_SOFTMAX,
        )?;

        let params = ctx.uniform("ev_sm_params", &KernelParams::new(0, 1.0));
        let output = ctx.storage::<f32>("ev_sm_output", batch * y);
        let labels = ctx.storage::<i32>("ev_sm_labels", batch);
        let err_output = ctx.storage::<f32>("ev_sm_err_output", batch * y);
        let confusion = ctx.storage::<u32>("ev_sm_confusion", y * y);
        let n_err = ctx.storage::<u32>("ev_sm_n_err", 1);
        let max_err = ctx.storage::<f32>("ev_sm_max_err", 1);
        let bind_group = ctx.bind_group(
            "ev_sm",
            &pipeline,
            &[&params, &output, &labels, &err_output, &confusion, &n_err, &max_err],
        );

        Ok(Self {
            pipeline,
            bind_group,
            params,
            output,
            labels,
            err_output,
            confusion,
            n_err,
            max_err,
            batch,
            y,
        })
    }

    /// Runs one evaluation and reads every output back into the host buffers.
    pub fn run(
        &self,
        ctx: &GpuContext,
        output: &[f32],
        labels: &[i32],
        batch_size: usize,
        multiplier: f32,
        err_output: &mut [f32],
        confusion: &mut [u32],
    ) -> FlowResult<SoftmaxStats> {
        ctx.upload(&self.params, &[KernelParams::new(batch_size, multiplier)]);
        ctx.upload(&self.output, output);
        ctx.upload(&self.labels, labels);
        ctx.upload(&self.confusion, &vec![0u32; self.y * self.y]);
        ctx.upload(&self.n_err, &[0u32]);

        ctx.dispatch("ev_sm", &self.pipeline, &self.bind_group, [1, 1, 1])?;

        err_output.copy_from_slice(&ctx.read::<f32>(&self.err_output, self.batch * self.y)?);
        confusion.copy_from_slice(&ctx.read::<u32>(&self.confusion, self.y * self.y)?);
        let n_err = ctx.read::<u32>(&self.n_err, 1)?;
        let max_err = ctx.read::<f32>(&self.max_err, 1)?;

        Ok(SoftmaxStats {
            n_err: n_err.first().copied().unwrap_or(0),
            max_err: max_err.first().copied().unwrap_or(0.0),
        })
    }
}

/// `[sum, max, min]` of the per-sample error of one pass.
pub type MseStats = [f32; 3];

pub struct MseKernel {
    pipeline: Arc<wgpu::ComputePipeline>,
    bind_group: wgpu::BindGroup,
    params: wgpu::Buffer,
    output: wgpu::Buffer,
    target: wgpu::Buffer,
    err_output: wgpu::Buffer,
    mse: wgpu::Buffer,
    stats: wgpu::Buffer,
    closest: Option<FindClosest>,
    batch: usize,
    y: usize,
}

struct FindClosest {
    pipeline: Arc<wgpu::ComputePipeline>,
    bind_group: wgpu::BindGroup,
    labels: wgpu::Buffer,
    n_err: wgpu::Buffer,
}

impl MseKernel {
    /// `class_targets` enables the nearest-class kernel.
    pub fn new(
        ctx: &GpuContext,
        batch: usize,
        y: usize,
        squared: bool,
        class_targets: Option<(&[f32], usize)>,
    ) -> FlowResult<Self> {
        let block_size = evaluator_block_size(batch, 128);
        let pipeline = ctx.program(
            "evaluator_mse",
            &[
                ("BLOCK_SIZE", block_size),
                ("BATCH", batch as u32),
                ("Y", y as u32),
                ("SQUARED", u32::from(squared)),
            ],
            EVALUATOR_MSE,
        )?;

        let params = ctx.uniform("ev_mse_params", &KernelParams::new(0, 1.0));
        let output = ctx.storage::<f32>("ev_mse_output", batch * y);
        let target = ctx.storage::<f32>("ev_mse_target", batch * y);
        let err_output = ctx.storage::<f32>("ev_mse_err_output", batch * y);
        let mse = ctx.storage::<f32>("ev_mse_mse", batch);
        let stats = ctx.storage::<f32>("ev_mse_stats", 3);
        let bind_group = ctx.bind_group(
            "ev_mse",
            &pipeline,
            &[&params, &output, &target, &err_output, &mse, &stats],
        );

        let closest = match class_targets {
            Some((targets, n_targets)) => {
                let pipeline = ctx.program(
                    "mse_find_closest",
                    &[("Y", y as u32), ("N_TARGETS", n_targets as u32)],
                    MSE_FIND_CLOSEST,
                )?;
                let targets = ctx.storage_init("ev_mse_class_targets", targets);
                let labels = ctx.storage::<i32>("ev_mse_labels", batch);
                let n_err = ctx.storage::<u32>("ev_mse_n_err", 1);
                let bind_group = ctx.bind_group(
                    "mse_find_closest",
                    &pipeline,
                    &[&params, &output, &targets, &labels, &n_err],
                );
                Some(FindClosest {
                    pipeline,
                    bind_group,
                    labels,
                    n_err,
                })
            }
            None => None,
        };

        Ok(Self {
            pipeline,
            bind_group,
            params,
            output,
            target,
            err_output,
            mse,
            stats,
            closest,
            batch,
            y,
        })
    }

    /// Runs one evaluation. Returns the pass statistics and, when the
    /// nearest-class kernel is enabled and `labels` given, its error count.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        ctx: &GpuContext,
        output: &[f32],
        target: &[f32],
        labels: Option<&[i32]>,
        batch_size: usize,
        multiplier: f32,
        err_output: &mut [f32],
        mse: &mut [f32],
    ) -> FlowResult<(MseStats, Option<u32>)> {
        ctx.upload(&self.params, &[KernelParams::new(batch_size, multiplier)]);
        ctx.upload(&self.output, output);
        ctx.upload(&self.target, target);

        ctx.dispatch("ev_mse", &self.pipeline, &self.bind_group, [1, 1, 1])?;

        let mut n_err = None;
        if let (Some(closest), Some(labels)) = (&self.closest, labels) {
            ctx.upload(&closest.labels, labels);
            ctx.upload(&closest.n_err, &[0u32]);
            let groups = (batch_size as u32).div_ceil(64).max(1);
            ctx.dispatch("mse_find_closest", &closest.pipeline, &closest.bind_group, [groups, 1, 1])?;
            n_err = ctx.read::<u32>(&closest.n_err, 1)?.first().copied();
        }

        err_output.copy_from_slice(&ctx.read::<f32>(&self.err_output, self.batch * self.y)?);
        mse.copy_from_slice(&ctx.read::<f32>(&self.mse, self.batch)?);
        let stats = ctx.read::<f32>(&self.stats, 3)?;

        Ok(([stats[0], stats[1], stats[2]], n_err))
    }
}
