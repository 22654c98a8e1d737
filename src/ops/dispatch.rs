//! Backend dispatch for units with interchangeable CPU and accelerator
//! implementations.
//!
//! A unit with numeric work implements [`AcceleratedUnit`] once: a
//! sequential `cpu_run` that is always present, and (with the `wgpu`
//! feature) a `gpu_init`/`gpu_run` pair whose presence is declared through
//! [`AcceleratedUnit::CAPABILITY`]. Wrapping it in [`Accelerated`] turns it
//! into a graph [`Unit`]:
//!
//! - `initialize` checks demanded inputs, sizes host buffers from the bound
//!   inputs and prepares the accelerator program, keyed by device and shape
//!   so a repeated call with unchanged shapes does nothing;
//! - `run` dispatches to the backend chosen at initialize time. A failing
//!   accelerator run is an error of the pass; it never falls back to the CPU.
//!
//! For the same inputs both implementations produce outputs equal within
//! [`F32_TOLERANCE`](crate::approx::F32_TOLERANCE).
//!
//! # Example
//! ```rust
//! use briny_flow::backend::{Backend, Device};
//! use briny_flow::graph::Signal;
//! use briny_flow::ops::dispatch::Accelerated;
//! use briny_flow::unit::{InitContext, Unit};
//! use briny_flow::units::EvaluatorSoftmax;
//!
//! let mut evaluator = Accelerated::new(EvaluatorSoftmax::new("ev"));
//! let signal = Signal::new();
//! let err = evaluator
//!     .initialize(&mut InitContext::new(&Device::Cpu, &signal))
//!     .unwrap_err();
//! assert!(err.is_configuration());
//! assert_eq!(evaluator.backend(), None::<Backend>);
//! ```

#[cfg(feature = "wgpu")]
use std::sync::Arc;

use log::debug;

use crate::attr::AttrHandle;
use crate::backend::Backend;
use crate::error::{FlowError, FlowResult};
#[cfg(feature = "wgpu")]
use crate::ops::wgpu::GpuContext;
use crate::unit::{InitContext, RunContext, Unit};

/// Which implementations a unit provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    CpuOnly,
    AcceleratorCapable,
}

/// A unit whose numeric work can run on either backend.
pub trait AcceleratedUnit: Send {
    const CAPABILITY: Capability;

    fn name(&self) -> &str;

    fn unbound(&self) -> Vec<&'static str>;

    fn bind_input(&mut self, input: &str, source: &AttrHandle) -> FlowResult<()>;

    fn outputs(&self) -> Vec<AttrHandle>;

    /// Shape-dependent defines of the unit (batch capacity, sample size...).
    /// Fails with a shape mismatch if the bound inputs are incompatible.
    fn shape_key(&self) -> FlowResult<Vec<usize>>;

    /// Allocates the host side of every output, sized from the bound inputs.
    fn init_host(&mut self) -> FlowResult<()>;

    fn cpu_run(&mut self) -> FlowResult<()>;

    /// Builds (or fetches from the context's cache) the unit's programs and
    /// allocates its device buffers.
    #[cfg(feature = "wgpu")]
    fn gpu_init(&mut self, _ctx: &Arc<GpuContext>) -> FlowResult<()> {
        Err(FlowError::Gpu(format!("`{}` has no accelerator path", self.name())))
    }

    /// Dispatches the unit's kernels and reads the results back.
    #[cfg(feature = "wgpu")]
    fn gpu_run(&mut self, _ctx: &Arc<GpuContext>) -> FlowResult<()> {
        Err(FlowError::Gpu(format!("`{}` has no accelerator path", self.name())))
    }

    fn save_state(&self) -> FlowResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn load_state(&mut self, _state: &[u8]) -> FlowResult<()> {
        Ok(())
    }

    fn resumed(&mut self) {}
}

/// Adapts an [`AcceleratedUnit`] to the graph's [`Unit`] trait.
pub struct Accelerated<U> {
    inner: U,
    backend: Option<Backend>,
    key: Option<(String, Vec<usize>)>,
    initializations: usize,
    #[cfg(feature = "wgpu")]
    gpu: Option<Arc<GpuContext>>,
}

impl<U: AcceleratedUnit> Accelerated<U> {
    pub fn new(inner: U) -> Self {
        Self {
            inner,
            backend: None,
            key: None,
            initializations: 0,
            #[cfg(feature = "wgpu")]
            gpu: None,
        }
    }

    pub fn inner(&self) -> &U {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut U {
        &mut self.inner
    }

    /// The backend chosen by the last initialize, if any.
    pub fn backend(&self) -> Option<Backend> {
        self.backend
    }

    /// How many times initialize actually (re)allocated the unit.
    pub fn initializations(&self) -> usize {
        self.initializations
    }
}

impl<U: AcceleratedUnit> Unit for Accelerated<U> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn unbound(&self) -> Vec<&'static str> {
        self.inner.unbound()
    }

    fn bind_input(&mut self, input: &str, source: &AttrHandle) -> FlowResult<()> {
        self.inner.bind_input(input, source)
    }

    fn outputs(&self) -> Vec<AttrHandle> {
        self.inner.outputs()
    }

    fn initialize(&mut self, ctx: &mut InitContext<'_>) -> FlowResult<()> {
        if let Some(attr) = self.inner.unbound().first() {
            return Err(FlowError::Configuration {
                unit: self.inner.name().to_string(),
                attr: attr.to_string(),
            });
        }

        let key = (ctx.device.guid().to_string(), self.inner.shape_key()?);
        if self.key.as_ref() == Some(&key) {
            debug!("{}: already initialized for {:?}", self.inner.name(), key);
            return Ok(());
        }

        self.inner.init_host()?;
        let backend = match (ctx.device.backend(), U::CAPABILITY) {
            (Backend::Wgpu, Capability::AcceleratorCapable) => {
                #[cfg(feature = "wgpu")]
                {
                    let gpu = ctx.device.gpu().cloned().ok_or_else(|| {
                        FlowError::DeviceUnavailable("device has no gpu context".into())
                    })?;
                    self.inner.gpu_init(&gpu)?;
                    self.gpu = Some(gpu);
                }
                Backend::Wgpu
            }
            _ => Backend::Cpu,
        };

        debug!("{}: initialized on {:?} with shape {:?}", self.inner.name(), backend, key.1);
        self.backend = Some(backend);
        self.key = Some(key);
        self.initializations += 1;
        Ok(())
    }

    fn run(&mut self, _ctx: &mut RunContext<'_>) -> FlowResult<()> {
        match self.backend {
            Some(Backend::Cpu) => self.inner.cpu_run(),
            #[cfg(feature = "wgpu")]
            Some(Backend::Wgpu) => match &self.gpu {
                Some(gpu) => self.inner.gpu_run(gpu),
                None => Err(FlowError::Gpu("gpu context was dropped".into())),
            },
            #[cfg(not(feature = "wgpu"))]
            Some(Backend::Wgpu) => Err(FlowError::Gpu("built without the `wgpu` feature".into())),
            None => Err(FlowError::Graph(format!(
                "`{}` ran before initialize",
                self.inner.name()
            ))),
        }
    }

    fn save_state(&self) -> FlowResult<Option<Vec<u8>>> {
        self.inner.save_state()
    }

    fn load_state(&mut self, state: &[u8]) -> FlowResult<()> {
        self.inner.load_state(state)
    }

    fn resumed(&mut self) {
        self.inner.resumed()
    }
}
