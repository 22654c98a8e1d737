//! The reference workload of device benchmarking on the accelerator.

use std::time::{Duration, Instant};

use super::GpuContext;
use crate::error::{FlowError, FlowResult};

const FEED_TANH: &str = include_str!("shaders/feed_tanh.wgsl");

/// Rejects block sizes the device cannot run before anything is compiled.
pub fn check_block_size(limits: &wgpu::Limits, block_size: u32) -> Result<(), String> {
    if block_size == 0 {
        return Err("block size must be positive".into());
    }
    let invocations = block_size * block_size;
    if invocations > limits.max_compute_invocations_per_workgroup {
        return Err(format!(
            "{invocations} invocations per workgroup exceed the limit of {}",
            limits.max_compute_invocations_per_workgroup
        ));
    }
    if block_size > limits.max_compute_workgroup_size_x
        || block_size > limits.max_compute_workgroup_size_y
    {
        return Err(format!(
            "workgroup size {block_size}x{block_size} exceeds {}x{}",
            limits.max_compute_workgroup_size_x, limits.max_compute_workgroup_size_y
        ));
    }
    let storage = 2 * invocations * std::mem::size_of::<f32>() as u32;
    if storage > limits.max_compute_workgroup_storage_size {
        return Err(format!(
            "{storage} bytes of workgroup storage exceed the limit of {}",
            limits.max_compute_workgroup_storage_size
        ));
    }
    Ok(())
}

/// Runs `c = 1.7159 * tanh(0.6666 * (a x b^T + bias))` with `block_size`
/// tiles and returns the wall-clock time (compile, upload, run and read
/// back) together with the result.
pub fn run(
    ctx: &GpuContext,
    a: &[f32],
    b: &[f32],
    bias: &[f32],
    width: usize,
    block_size: u32,
) -> FlowResult<(Duration, Vec<f32>)> {
    check_block_size(&ctx.limits, block_size).map_err(|reason| {
        FlowError::UnsupportedBackendConfiguration {
            device: ctx.guid.clone(),
            block_size,
            reason,
        }
    })?;
    let a_height = a.len() / width.max(1);
    let b_height = bias.len();

    let start = Instant::now();
    let pipeline = ctx
        .program(
            "feed_tanh",
            &[
                ("BLOCK_SIZE", block_size),
                ("A_HEIGHT", a_height as u32),
                ("B_HEIGHT", b_height as u32),
                ("AB_WIDTH", width as u32),
            ],
            FEED_TANH,
        )
        .map_err(|e| FlowError::UnsupportedBackendConfiguration {
            device: ctx.guid.clone(),
            block_size,
            reason: e.to_string(),
        })?;

    let a_buf = ctx.storage_init("feed_a", a);
    let b_buf = ctx.storage_init("feed_b", b);
    let bias_buf = ctx.storage_init("feed_bias", bias);
    let c_buf = ctx.storage::<f32>("feed_c", a_height * b_height);
    let bind_group = ctx.bind_group("feed_tanh", &pipeline, &[&a_buf, &b_buf, &bias_buf, &c_buf]);

    let groups = [
        (b_height as u32).div_ceil(block_size),
        (a_height as u32).div_ceil(block_size),
        1,
    ];
    ctx.dispatch("feed_tanh", &pipeline, &bind_group, groups)?;
    let c = ctx.read::<f32>(&c_buf, a_height * b_height)?;

    Ok((start.elapsed(), c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_checks_follow_limits() {
        let limits = wgpu::Limits::default();
        assert!(check_block_size(&limits, 8).is_ok());
        assert!(check_block_size(&limits, 16).is_ok());
        assert!(check_block_size(&limits, 64).is_err());
        assert!(check_block_size(&limits, 0).is_err());
    }
}
