#[cfg(feature = "wgpu")]
use std::sync::Arc;

use crate::attr::{Attr, AttrHandle, Slot};
use crate::error::{FlowError, FlowResult};
use crate::ops::cpu;
use crate::ops::dispatch::{AcceleratedUnit, Capability};
#[cfg(feature = "wgpu")]
use crate::ops::wgpu::{GpuContext, evaluator::SoftmaxKernel};
use crate::tensors::Tensor;
use crate::unit::{bind_slot, no_such_input, unbound_of};

/// Scores a batch of softmax outputs against integer labels.
///
/// Demands `output` (`[capacity, Y]`), `labels` (`capacity` entries, `-1`
/// for unused rows) and `batch_size`. Every pass produces, from the current
/// batch only:
///
/// - `err_output`: `(output - one_hot(label)) * multiplier`, zero for rows
///   with a negative label and rows past `batch_size`;
/// - `confusion_matrix`: `Y x Y`, `[predicted][label]`;
/// - `n_err`: samples whose argmax is not their label;
/// - `max_err_output_sum`: largest `sum |err|` of a sample.
pub struct EvaluatorSoftmax {
    name: String,
    pub output: Slot<Tensor<f32>>,
    pub labels: Slot<Vec<i32>>,
    pub batch_size: Slot<usize>,
    /// Scale errors by `1 / batch_size`.
    pub averaged: bool,
    pub err_output: Attr<Tensor<f32>>,
    pub confusion_matrix: Attr<Tensor<u32>>,
    pub n_err: Attr<u32>,
    pub max_err_output_sum: Attr<f32>,
    #[cfg(feature = "wgpu")]
    kernel: Option<SoftmaxKernel>,
}

impl EvaluatorSoftmax {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: Slot::new("output"),
            labels: Slot::new("labels"),
            batch_size: Slot::new("batch_size"),
            averaged: true,
            err_output: Attr::default(),
            confusion_matrix: Attr::default(),
            n_err: Attr::new(0),
            max_err_output_sum: Attr::new(0.0),
            #[cfg(feature = "wgpu")]
            kernel: None,
        }
    }

    pub fn averaged(mut self, averaged: bool) -> Self {
        self.averaged = averaged;
        self
    }

    /// Batch size and error multiplier of the current pass, after checking
    /// the inputs against the buffers.
    fn pass_args(&self) -> FlowResult<(usize, f32)> {
        let (capacity, classes) = {
            let output = self.output.get(&self.name)?.read();
            (output.rows(), output.sample_size())
        };
        let batch_size = super::batch_size(&self.name, &self.batch_size, capacity)?;
        let labels = self.labels.get(&self.name)?.read();
        super::check_labels(&self.name, &labels, batch_size, capacity, classes)?;
        Ok((batch_size, super::multiplier(self.averaged, batch_size)))
    }
}

impl AcceleratedUnit for EvaluatorSoftmax {
    const CAPABILITY: Capability = Capability::AcceleratorCapable;

    fn name(&self) -> &str {
        &self.name
    }

    fn unbound(&self) -> Vec<&'static str> {
        unbound_of(&[
            ("output", self.output.is_bound()),
            ("labels", self.labels.is_bound()),
            ("batch_size", self.batch_size.is_bound()),
        ])
    }

    fn bind_input(&mut self, input: &str, source: &AttrHandle) -> FlowResult<()> {
        match input {
            "output" => bind_slot(&self.name, &mut self.output, source),
            "labels" => bind_slot(&self.name, &mut self.labels, source),
            "batch_size" => bind_slot(&self.name, &mut self.batch_size, source),
            _ => Err(no_such_input(&self.name, input)),
        }
    }

    fn outputs(&self) -> Vec<AttrHandle> {
        vec![
            self.err_output.handle("err_output"),
            self.confusion_matrix.handle("confusion_matrix"),
            self.n_err.handle("n_err"),
            self.max_err_output_sum.handle("max_err_output_sum"),
        ]
    }

    fn shape_key(&self) -> FlowResult<Vec<usize>> {
        let output = self.output.get(&self.name)?.read();
        if output.shape.len() < 2 || output.sample_size() == 0 {
            return Err(FlowError::shape(
                &self.name,
                format!("output must be [batch, classes], got {:?}", output.shape),
            ));
        }
        let labels = self.labels.get(&self.name)?.read().len();
        if labels != output.rows() {
            return Err(FlowError::shape(
                &self.name,
                format!("{labels} labels for {} output rows", output.rows()),
            ));
        }
        Ok(vec![output.rows(), output.sample_size()])
    }

    fn init_host(&mut self) -> FlowResult<()> {
        let (capacity, classes) = {
            let output = self.output.get(&self.name)?.read();
            (output.rows(), output.sample_size())
        };
        self.err_output.set(Tensor::zeros(vec![capacity, classes]));
        self.confusion_matrix.set(Tensor::zeros(vec![classes, classes]));
        self.n_err.set(0);
        self.max_err_output_sum.set(0.0);
        Ok(())
    }

    fn cpu_run(&mut self) -> FlowResult<()> {
        let (batch_size, multiplier) = self.pass_args()?;
        let output = self.output.get(&self.name)?.read();
        let labels = self.labels.get(&self.name)?.read();
        let mut err_output = self.err_output.write();
        let mut confusion = self.confusion_matrix.write();

        confusion.data.fill(0);
        let stats = cpu::evaluate_softmax(
            &output,
            &labels,
            batch_size,
            multiplier,
            &mut err_output,
            &mut confusion.data,
        );

        self.n_err.set(stats.n_err);
        self.max_err_output_sum.set(stats.max_err);
        Ok(())
    }

    #[cfg(feature = "wgpu")]
    fn gpu_init(&mut self, ctx: &Arc<GpuContext>) -> FlowResult<()> {
        let key = self.shape_key()?;
        self.kernel = Some(SoftmaxKernel::new(ctx, key[0], key[1])?);
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
        let labels = self.labels.get(&self.name)?.read();
        let mut err_output = self.err_output.write();
        let mut confusion = self.confusion_matrix.write();

        let stats = kernel.run(
            ctx,
            &output.data,
            &labels,
            batch_size,
            multiplier,
            &mut err_output.data,
            &mut confusion.data,
        )?;

        self.n_err.set(stats.n_err);
        self.max_err_output_sum.set(stats.max_err);
        Ok(())
    }
}
