#[cfg(feature = "wgpu")]
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::attr::{Attr, AttrHandle, Slot};
use crate::error::{FlowError, FlowResult};
use crate::ops::cpu;
use crate::ops::dispatch::{AcceleratedUnit, Capability};
#[cfg(feature = "wgpu")]
use crate::ops::wgpu::{GpuContext, evaluator::MseKernel};
use crate::tensors::Tensor;
use crate::unit::{bind_slot, no_such_input, unbound_of};

/// Running `[sum, max, min]` of the per-sample error since the last reset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MseMetrics {
    pub sum: f32,
    pub max: f32,
    pub min: f32,
}

impl Default for MseMetrics {
    fn default() -> Self {
        Self {
            sum: 0.0,
            max: 0.0,
            min: 1.0e30,
        }
    }
}

impl MseMetrics {
    fn update(&mut self, sum: f32, max: f32, min: f32) {
        self.sum += sum;
        self.max = self.max.max(max);
        self.min = self.min.min(min);
    }
}

/// Scores a batch of regression outputs against targets.
///
/// Demands `output`, `target` (same shape) and `batch_size`; `labels` is
/// optional and, together with [`EvaluatorMse::class_targets`], enables the
/// nearest-class error count.
pub struct EvaluatorMse {
    name: String,
    pub output: Slot<Tensor<f32>>,
    pub target: Slot<Tensor<f32>>,
    pub batch_size: Slot<usize>,
    pub labels: Slot<Vec<i32>>,
    /// One target vector per class, `[classes, Y]`.
    pub class_targets: Option<Tensor<f32>>,
    pub averaged: bool,
    /// Report the mean squared error itself instead of its square root.
    pub squared: bool,
    pub err_output: Attr<Tensor<f32>>,
    /// Per-sample error of the current batch.
    pub mse: Attr<Vec<f32>>,
    pub metrics: Attr<MseMetrics>,
    /// Samples of the current batch whose nearest class target is not their label.
    pub n_err: Attr<u32>,
    #[cfg(feature = "wgpu")]
    kernel: Option<MseKernel>,
}

impl EvaluatorMse {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: Slot::new("output"),
            target: Slot::new("target"),
            batch_size: Slot::new("batch_size"),
            labels: Slot::new("labels"),
            class_targets: None,
            averaged: true,
            squared: false,
            err_output: Attr::default(),
            mse: Attr::default(),
            metrics: Attr::default(),
            n_err: Attr::new(0),
            #[cfg(feature = "wgpu")]
            kernel: None,
        }
    }

    pub fn squared(mut self, squared: bool) -> Self {
        self.squared = squared;
        self
    }

    pub fn averaged(mut self, averaged: bool) -> Self {
        self.averaged = averaged;
        self
    }

    pub fn with_class_targets(mut self, class_targets: Tensor<f32>) -> Self {
        self.class_targets = Some(class_targets);
        self
    }

    pub fn reset_metrics(&self) {
        self.metrics.set(MseMetrics::default());
    }

    fn pass_args(&self) -> FlowResult<(usize, f32)> {
        let capacity = self.output.get(&self.name)?.read().rows();
        let batch_size = super::batch_size(&self.name, &self.batch_size, capacity)?;
        if let (Some(targets), Some(labels)) = (&self.class_targets, self.labels.source()) {
            super::check_labels(&self.name, &labels.read(), batch_size, capacity, targets.rows())?;
        }
        Ok((batch_size, super::multiplier(self.averaged, batch_size)))
    }

    fn record(&self, batch_size: usize, stats: [f32; 3], n_err: Option<u32>) {
        if batch_size > 0 {
            self.metrics.write().update(stats[0], stats[1], stats[2]);
        }
        self.n_err.set(n_err.unwrap_or(0));
    }
}

impl AcceleratedUnit for EvaluatorMse {
    const CAPABILITY: Capability = Capability::AcceleratorCapable;

    fn name(&self) -> &str {
        &self.name
    }

    fn unbound(&self) -> Vec<&'static str> {
        unbound_of(&[
            ("output", self.output.is_bound()),
            ("target", self.target.is_bound()),
            ("batch_size", self.batch_size.is_bound()),
        ])
    }

    fn bind_input(&mut self, input: &str, source: &AttrHandle) -> FlowResult<()> {
        match input {
            "output" => bind_slot(&self.name, &mut self.output, source),
            "target" => bind_slot(&self.name, &mut self.target, source),
            "batch_size" => bind_slot(&self.name, &mut self.batch_size, source),
            "labels" => bind_slot(&self.name, &mut self.labels, source),
            _ => Err(no_such_input(&self.name, input)),
        }
    }

    fn outputs(&self) -> Vec<AttrHandle> {
        vec![
            self.err_output.handle("err_output"),
            self.mse.handle("mse"),
            self.metrics.handle("metrics"),
            self.n_err.handle("n_err"),
        ]
    }

    fn shape_key(&self) -> FlowResult<Vec<usize>> {
        let output = self.output.get(&self.name)?.read();
        let target = self.target.get(&self.name)?.read();
        if target.len() != output.len() {
            return Err(FlowError::shape(
                &self.name,
                format!("target.size != output.size ({} != {})", target.len(), output.len()),
            ));
        }
        let mut key = vec![output.rows(), output.sample_size(), usize::from(self.squared), 0];
        if let Some(targets) = &self.class_targets {
            if targets.sample_size() != output.sample_size() {
                return Err(FlowError::shape(
                    &self.name,
                    format!(
                        "class targets have {} elements per class, outputs {}",
                        targets.sample_size(),
                        output.sample_size()
                    ),
                ));
            }
            key[3] = targets.rows();
        }
        Ok(key)
    }

    fn init_host(&mut self) -> FlowResult<()> {
        let shape = self.output.get(&self.name)?.read().shape.clone();
        let capacity = shape.first().copied().unwrap_or(0);
        self.err_output.set(Tensor::zeros(shape));
        self.mse.set(vec![0.0; capacity]);
        self.n_err.set(0);
        Ok(())
    }

    fn cpu_run(&mut self) -> FlowResult<()> {
        let (batch_size, multiplier) = self.pass_args()?;
        let output = self.output.get(&self.name)?.read();
        let target = self.target.get(&self.name)?.read();

        let stats = {
            let mut err_output = self.err_output.write();
            let mut mse = self.mse.write();
            cpu::evaluate_mse(
                &output,
                &target,
                batch_size,
                multiplier,
                self.squared,
                &mut err_output,
                &mut mse,
            );
            let used = &mse[..batch_size];
            [
                used.iter().sum(),
                used.iter().copied().fold(f32::MIN, f32::max),
                used.iter().copied().fold(f32::MAX, f32::min),
            ]
        };

        let n_err = match (&self.class_targets, self.labels.source()) {
            (Some(targets), Some(labels)) => Some(cpu::count_misclassified(
                &output,
                &labels.read(),
                batch_size,
                targets,
            )),
            _ => None,
        };

        self.record(batch_size, stats, n_err);
        Ok(())
    }

    #[cfg(feature = "wgpu")]
    fn gpu_init(&mut self, ctx: &Arc<GpuContext>) -> FlowResult<()> {
        let key = self.shape_key()?;
        let targets = match &self.class_targets {
            Some(t) if self.labels.is_bound() => Some((t.data.as_slice(), t.rows())),
            _ => None,
        };
        self.kernel = Some(MseKernel::new(ctx, key[0], key[1], self.squared, targets)?);
        Ok(())
    }

    #[cfg(feature = "wgpu")]
    fn gpu_run(&mut self, ctx: &Arc<GpuContext>) -> FlowResult<()> {
        let (batch_size, multiplier) = self.pass_args()?;
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| FlowError::Gpu(format!("`{}` has no kernel", self.name)))?;
        let output = self.output.get(&self.name)?.read();
        let target = self.target.get(&self.name)?.read();
        let labels = self.labels.source().map(|l| l.read());

        let (stats, n_err) = {
            let mut err_output = self.err_output.write();
            let mut mse = self.mse.write();
            kernel.run(
                ctx,
                &output.data,
                &target.data,
                labels.as_deref().map(Vec::as_slice),
                batch_size,
                multiplier,
                &mut err_output.data,
                &mut mse,
            )?
        };

        self.record(batch_size, stats, n_err);
        Ok(())
    }

    fn save_state(&self) -> FlowResult<Option<Vec<u8>>> {
        Ok(Some(bincode::serialize(&*self.metrics.read())?))
    }

    fn load_state(&mut self, state: &[u8]) -> FlowResult<()> {
        self.metrics.set(bincode::deserialize(state)?);
        Ok(())
    }
}
