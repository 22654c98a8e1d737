//! Accelerator backend using WGPU + WGSL compute shaders.
//!
//! This module owns the execution context of one adapter ([`GpuContext`]),
//! the per-context program cache, and the small set of buffer helpers the
//! accelerated units are written against:
//!
//! - [`evaluator`]: softmax and MSE evaluators, nearest-class lookup
//! - [`feed_tanh`]: the benchmark reference workload
//!
//! Programs are WGSL sources with shape-dependent constants (`BATCH`, `Y`,
//! `BLOCK_SIZE`...) prepended, compiled once per context and key.
//!
//! Every `run`-side helper blocks until the device has finished
//! (`PollType::Wait`), so an output read back here is final.

pub mod evaluator;
pub mod feed_tanh;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use bytemuck::Pod;
use log::{debug, info};
use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use crate::error::{FlowError, FlowResult};

/// Basic wrapper for common GPU errors.
#[derive(Debug)]
pub enum GpuError {
    /// An error in requesting the device from an adapter.
    Device(wgpu::RequestDeviceError),
    /// Shader or pipeline validation failed.
    Validation(String),
    /// Waiting on the device or mapping a buffer failed.
    Execution(String),
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device(e) => write!(f, "device error: {e}"),
            Self::Validation(e) => write!(f, "validation error: {e}"),
            Self::Execution(e) => write!(f, "execution error: {e}"),
        }
    }
}

impl std::error::Error for GpuError {}

impl From<GpuError> for FlowError {
    fn from(e: GpuError) -> Self {
        FlowError::Gpu(e.to_string())
    }
}

/// The device, queue and compiled programs of one adapter.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    /// Identity of the adapter (vendor/name/device id).
    pub guid: String,
    /// The execution context (graphics API) the adapter belongs to.
    pub context: String,
    pub limits: wgpu::Limits,
    programs: Mutex<HashMap<String, Arc<wgpu::ComputePipeline>>>,
}

lazy_static::lazy_static! {
    static ref ACTIVE_CONTEXT: Mutex<Weak<GpuContext>> = Mutex::new(Weak::new());
}

impl GpuContext {
    /// Opens a device on `adapter` with the adapter's own limits.
    pub fn from_adapter(adapter: &wgpu::Adapter, guid: String) -> FlowResult<Self> {
        let info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_flow"),
            required_features: wgpu::Features::empty(),
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(GpuError::Device)?;

        Ok(Self {
            device,
            queue,
            guid,
            context: format!("{:?}", info.backend),
            limits,
            programs: Mutex::new(HashMap::new()),
        })
    }

    /// Makes `ctx` the process-wide execution context.
    ///
    /// Returns the context units must use: `ctx` itself, or the already
    /// active context if it belongs to the same device. Activating a second
    /// device while another one is still alive is an error.
    pub fn activate(ctx: Arc<GpuContext>) -> FlowResult<Arc<GpuContext>> {
        let mut active = ACTIVE_CONTEXT.lock();
        if let Some(current) = active.upgrade() {
            if Arc::ptr_eq(&current, &ctx) || current.guid == ctx.guid {
                return Ok(current);
            }
            return Err(FlowError::DeviceUnavailable(format!(
                "execution context of `{}` is still active, cannot activate `{}`",
                current.guid, ctx.guid
            )));
        }
        info!("activated execution context {} ({})", ctx.guid, ctx.context);
        *active = Arc::downgrade(&ctx);
        Ok(ctx)
    }

    /// The active context, if one is alive.
    pub fn active() -> Option<Arc<GpuContext>> {
        ACTIVE_CONTEXT.lock().upgrade()
    }

    /// Compiles `source` with `defines` prepended as `const NAME: u32`,
    /// or returns the cached pipeline for the same `key` and defines.
    pub fn program(
        &self,
        key: &str,
        defines: &[(&str, u32)],
        source: &str,
    ) -> FlowResult<Arc<wgpu::ComputePipeline>> {
        let mut full_key = key.to_string();
        for (name, value) in defines {
            let _ = write!(full_key, "_{name}{value}");
        }
        if let Some(pipeline) = self.programs.lock().get(&full_key) {
            return Ok(Arc::clone(pipeline));
        }

        let mut text = String::with_capacity(source.len() + 64 * defines.len());
        for (name, value) in defines {
            let _ = writeln!(text, "const {name}: u32 = {value}u;");
        }
        text.push_str(source);

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(key),
            source: wgpu::ShaderSource::Wgsl(text.into()),
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&full_key),
            layout: None,
            module: &module,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::Validation(format!("{full_key}: {err}")).into());
        }

        debug!("{}: built program {}", self.guid, full_key);
        let pipeline = Arc::new(pipeline);
        self.programs.lock().insert(full_key, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// A zero-initialized storage buffer of `len` elements of `T`.
    pub fn storage<T: Pod>(&self, label: &str, len: usize) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (len.max(1) * std::mem::size_of::<T>()) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }

    /// A storage buffer holding `data`.
    pub fn storage_init<T: Pod>(&self, label: &str, data: &[T]) -> wgpu::Buffer {
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        })
    }

    pub fn uniform<T: Pod>(&self, label: &str, value: &T) -> wgpu::Buffer {
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::bytes_of(value),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        })
    }

    /// Queues a host-to-device copy of `data` into `buffer`.
    pub fn upload<T: Pod>(&self, buffer: &wgpu::Buffer, data: &[T]) {
        if !data.is_empty() {
            self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(data));
        }
    }

    /// Binds `buffers` to bindings `0..n` of group 0 of `pipeline`.
    pub fn bind_group(
        &self,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        buffers: &[&wgpu::Buffer],
    ) -> wgpu::BindGroup {
        let layout = pipeline.get_bind_group_layout(0);
        let entries: Vec<wgpu::BindGroupEntry<'_>> = buffers
            .iter()
            .enumerate()
            .map(|(i, buffer)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &layout,
            entries: &entries,
        })
    }

    /// Runs `pipeline` over `workgroups` and waits for completion.
    pub fn dispatch(
        &self,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        bind_group: &wgpu::BindGroup,
        workgroups: [u32; 3],
    ) -> FlowResult<()> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
        }
        self.queue.submit(Some(encoder.finish()));
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::Validation(format!("{label}: {err}")).into());
        }
        self.wait()
    }

    /// Blocks until all submitted work has finished.
    pub fn wait(&self) -> FlowResult<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| GpuError::Execution(e.to_string()))?;
        Ok(())
    }

    /// Copies the first `len` elements of `buffer` back to the host.
    pub fn read<T: Pod>(&self, buffer: &wgpu::Buffer, len: usize) -> FlowResult<Vec<T>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let size = (len * std::mem::size_of::<T>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("read") });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.wait()?;
        rx.recv()
            .map_err(|e| GpuError::Execution(e.to_string()))?
            .map_err(|e| GpuError::Execution(e.to_string()))?;

        let data = slice.get_mapped_range();
        let out = bytemuck::pod_collect_to_vec(&data);
        drop(data);
        staging.unmap();
        Ok(out)
    }
}

/// Scalar arguments shared by the evaluator kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct KernelParams {
    pub batch_size: u32,
    pub multiplier: f32,
    pub _pad: [u32; 2],
}

impl KernelParams {
    pub fn new(batch_size: usize, multiplier: f32) -> Self {
        Self {
            batch_size: batch_size as u32,
            multiplier,
            _pad: [0; 2],
        }
    }
}
