//! Accelerator discovery.

#[cfg(feature = "wgpu")]
pub use self::wgpu_probe::{WgpuAccelerator, WgpuProbe};
use super::Accelerator;

/// Source of the accelerators present on this machine.
pub trait DeviceProbe {
    fn discover(&self) -> Vec<Box<dyn Accelerator>>;
}

/// A machine without accelerators.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAccelerators;

impl DeviceProbe for NoAccelerators {
    fn discover(&self) -> Vec<Box<dyn Accelerator>> {
        Vec::new()
    }
}

/// The default probe of this build: wgpu adapters with the `wgpu` feature,
/// nothing without it.
pub fn default_probe() -> Box<dyn DeviceProbe> {
    #[cfg(feature = "wgpu")]
    {
        Box::new(WgpuProbe::default())
    }
    #[cfg(not(feature = "wgpu"))]
    {
        Box::new(NoAccelerators)
    }
}

#[cfg(feature = "wgpu")]
mod wgpu_probe {
    use std::sync::Arc;

    use log::{debug, info};
    use parking_lot::Mutex;

    use super::DeviceProbe;
    use crate::backend::Device;
    use crate::device::{Accelerator, BenchOutcome, BenchTarget, ReferenceWorkload};
    use crate::error::FlowResult;
    use crate::ops::wgpu::{GpuContext, feed_tanh};

    /// Enumerates every hardware adapter wgpu can reach.
    #[derive(Debug, Clone, Copy)]
    pub struct WgpuProbe {
        pub backends: wgpu::Backends,
    }

    impl Default for WgpuProbe {
        fn default() -> Self {
            Self {
                backends: wgpu::Backends::all(),
            }
        }
    }

    impl DeviceProbe for WgpuProbe {
        fn discover(&self) -> Vec<Box<dyn Accelerator>> {
            let instance = wgpu::Instance::default();
            let mut found: Vec<Box<dyn Accelerator>> = Vec::new();
            for adapter in instance.enumerate_adapters(self.backends) {
                let info = adapter.get_info();
                if info.device_type == wgpu::DeviceType::Cpu {
                    debug!("skipping software adapter {}", info.name);
                    continue;
                }
                let accelerator = WgpuAccelerator::new(adapter);
                if found.iter().any(|a| a.guid() == accelerator.guid()) {
                    debug!("{} is reachable through several contexts", accelerator.guid());
                    continue;
                }
                info!("found {} ({})", accelerator.guid(), accelerator.context());
                found.push(Box::new(accelerator));
            }
            found
        }
    }

    /// One wgpu adapter. Its device is opened on first use and kept.
    pub struct WgpuAccelerator {
        adapter: wgpu::Adapter,
        guid: String,
        context: String,
        memory_size: u64,
        gpu: Mutex<Option<Arc<GpuContext>>>,
    }

    impl WgpuAccelerator {
        pub fn new(adapter: wgpu::Adapter) -> Self {
            let info = adapter.get_info();
            let guid = format!("{:04x}/{}/{:04x}", info.vendor, info.name.trim(), info.device);
            let memory_size = adapter.limits().max_buffer_size / 10 * 9;
            Self {
                adapter,
                guid,
                context: format!("{:?}", info.backend),
                memory_size,
                gpu: Mutex::new(None),
            }
        }

        fn gpu(&self) -> FlowResult<Arc<GpuContext>> {
            let mut slot = self.gpu.lock();
            if let Some(gpu) = slot.as_ref() {
                return Ok(Arc::clone(gpu));
            }
            let gpu = Arc::new(GpuContext::from_adapter(&self.adapter, self.guid.clone())?);
            *slot = Some(Arc::clone(&gpu));
            Ok(gpu)
        }
    }

    impl BenchTarget for WgpuAccelerator {
        fn guid(&self) -> &str {
            &self.guid
        }

        fn run_reference(&self, workload: &ReferenceWorkload, block_size: u32) -> FlowResult<BenchOutcome> {
            let gpu = self.gpu()?;
            let a: Vec<f32> = workload.a.iter().map(|&x| x as f32).collect();
            let b: Vec<f32> = workload.b.iter().map(|&x| x as f32).collect();
            let bias: Vec<f32> = workload.bias.iter().map(|&x| x as f32).collect();
            let (elapsed, output) =
                feed_tanh::run(&gpu, &a, &b, &bias, workload.shape.ab_width, block_size)?;
            Ok(BenchOutcome {
                elapsed,
                output: output.into_iter().map(f64::from).collect(),
            })
        }
    }

    impl Accelerator for WgpuAccelerator {
        fn context(&self) -> &str {
            &self.context
        }

        fn memory_size(&self) -> u64 {
            self.memory_size
        }

        fn open(&self) -> FlowResult<Device> {
            Ok(Device::Wgpu(GpuContext::activate(self.gpu()?)?))
        }
    }
}
