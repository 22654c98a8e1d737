use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::attr::{Attr, AttrHandle};
use crate::error::{FlowError, FlowResult};
use crate::tensors::Tensor;
use crate::unit::{InitContext, RunContext, Unit};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoaderState {
    cursor: usize,
    order: Vec<usize>,
    epoch: u64,
}

/// Serves fixed-capacity minibatches from samples held in memory.
///
/// Each pass fills `minibatch_data` (`[capacity, ...]`) with the next
/// `minibatch_size` samples; the last minibatch of an epoch may be short,
/// in which case the unused rows are zeroed and their labels set to `-1`.
/// `epoch_ended` is set on the pass that serves the last sample of an
/// epoch.
pub struct MemoryLoader {
    name: String,
    samples: Tensor<f32>,
    labels: Option<Vec<i32>>,
    targets: Option<Tensor<f32>>,
    capacity: usize,
    shuffle: bool,
    pub minibatch_data: Attr<Tensor<f32>>,
    pub minibatch_labels: Attr<Vec<i32>>,
    pub minibatch_targets: Attr<Tensor<f32>>,
    pub minibatch_size: Attr<usize>,
    pub epoch_ended: Attr<bool>,
    pub epoch_number: Attr<u64>,
    cursor: usize,
    order: Vec<usize>,
}

impl MemoryLoader {
    pub fn new(name: impl Into<String>, samples: Tensor<f32>, capacity: usize) -> FlowResult<Self> {
        let name = name.into();
        if samples.rows() == 0 || capacity == 0 {
            return Err(FlowError::shape(
                &name,
                format!("{} samples with a batch capacity of {capacity}", samples.rows()),
            ));
        }
        let order = (0..samples.rows()).collect();
        Ok(Self {
            name,
            samples,
            labels: None,
            targets: None,
            capacity,
            shuffle: false,
            minibatch_data: Attr::default(),
            minibatch_labels: Attr::default(),
            minibatch_targets: Attr::default(),
            minibatch_size: Attr::new(0),
            epoch_ended: Attr::new(false),
            epoch_number: Attr::new(0),
            cursor: 0,
            order,
        })
    }

    /// One label per sample.
    pub fn with_labels(mut self, labels: Vec<i32>) -> FlowResult<Self> {
        if labels.len() != self.samples.rows() {
            return Err(FlowError::shape(
                &self.name,
                format!("{} labels for {} samples", labels.len(), self.samples.rows()),
            ));
        }
        self.labels = Some(labels);
        Ok(self)
    }

    /// One target row per sample.
    pub fn with_targets(mut self, targets: Tensor<f32>) -> FlowResult<Self> {
        if targets.rows() != self.samples.rows() {
            return Err(FlowError::shape(
                &self.name,
                format!("{} targets for {} samples", targets.rows(), self.samples.rows()),
            ));
        }
        self.targets = Some(targets);
        Ok(self)
    }

    /// Reshuffle the sample order at the start of every epoch.
    pub fn shuffled(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn batch_shape(&self, tensor: &Tensor<f32>) -> Vec<usize> {
        let mut shape = tensor.shape.clone();
        shape[0] = self.capacity;
        shape
    }
}

impl Unit for MemoryLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn outputs(&self) -> Vec<AttrHandle> {
        vec![
            self.minibatch_data.handle("minibatch_data"),
            self.minibatch_labels.handle("minibatch_labels"),
            self.minibatch_targets.handle("minibatch_targets"),
            self.minibatch_size.handle("minibatch_size"),
            self.epoch_ended.handle("epoch_ended"),
            self.epoch_number.handle("epoch_number"),
        ]
    }

    fn initialize(&mut self, _ctx: &mut InitContext<'_>) -> FlowResult<()> {
        let shape = self.batch_shape(&self.samples);
        if self.minibatch_data.read().shape != shape {
            self.minibatch_data.set(Tensor::zeros(shape));
            self.minibatch_labels.set(vec![-1; self.capacity]);
            if let Some(targets) = &self.targets {
                self.minibatch_targets.set(Tensor::zeros(self.batch_shape(targets)));
            }
        }
        Ok(())
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> FlowResult<()> {
        if self.cursor == 0 && self.shuffle {
            self.order.shuffle(&mut *ctx.rng);
        }

        let total = self.order.len();
        let n = self.capacity.min(total - self.cursor);
        let indices = &self.order[self.cursor..self.cursor + n];

        {
            let mut data = self.minibatch_data.write();
            for (row, &i) in indices.iter().enumerate() {
                data.row_mut(row).copy_from_slice(self.samples.row(i));
            }
            data.clear_rows_from(n);
        }
        {
            let mut labels = self.minibatch_labels.write();
            labels.fill(-1);
            if let Some(source) = &self.labels {
                for (row, &i) in indices.iter().enumerate() {
                    labels[row] = source[i];
                }
            }
        }
        if let Some(source) = &self.targets {
            let mut targets = self.minibatch_targets.write();
            for (row, &i) in indices.iter().enumerate() {
                targets.row_mut(row).copy_from_slice(source.row(i));
            }
            targets.clear_rows_from(n);
        }

        self.minibatch_size.set(n);
        self.cursor += n;
        let ended = self.cursor >= total;
        self.epoch_ended.set(ended);
        if ended {
            self.cursor = 0;
            *self.epoch_number.write() += 1;
        }
        Ok(())
    }

    fn save_state(&self) -> FlowResult<Option<Vec<u8>>> {
        let state = LoaderState {
            cursor: self.cursor,
            order: self.order.clone(),
            epoch: self.epoch_number.get(),
        };
        Ok(Some(bincode::serialize(&state)?))
    }

    fn load_state(&mut self, state: &[u8]) -> FlowResult<()> {
        let state: LoaderState = bincode::deserialize(state)?;
        if state.order.len() != self.samples.rows() || state.cursor > state.order.len() {
            return Err(FlowError::Checkpoint(format!(
                "`{}` holds {} samples, the checkpoint {}",
                self.name,
                self.samples.rows(),
                state.order.len()
            )));
        }
        self.cursor = state.cursor;
        self.order = state.order;
        self.epoch_number.set(state.epoch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::backend::Device;
    use crate::graph::Signal;

    #[test]
    fn short_last_batch_is_padded() {
        let samples = Tensor::new(vec![5, 2], (0..10).map(|x| x as f32).collect());
        let mut loader = MemoryLoader::new("loader", samples, 3)
            .unwrap()
            .with_labels(vec![0, 1, 2, 0, 1])
            .unwrap();
        let signal = Signal::new();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        loader.initialize(&mut InitContext::new(&Device::Cpu, &signal)).unwrap();

        loader.run(&mut RunContext::new(&mut rng, &signal)).unwrap();
        assert_eq!(loader.minibatch_size.get(), 3);
        assert!(!loader.epoch_ended.get());

        loader.run(&mut RunContext::new(&mut rng, &signal)).unwrap();
        assert_eq!(loader.minibatch_size.get(), 2);
        assert!(loader.epoch_ended.get());
        assert_eq!(loader.epoch_number.get(), 1);
        assert_eq!(loader.minibatch_labels.get(), vec![0, 1, -1]);
        assert_eq!(loader.minibatch_data.read().row(0), &[6.0, 7.0]);
        assert_eq!(loader.minibatch_data.read().row(2), &[0.0, 0.0]);
    }

    #[test]
    fn shuffled_epoch_covers_every_sample() {
        let samples = Tensor::new(vec![6, 1], (0..6).map(|x| x as f32).collect());
        let mut loader = MemoryLoader::new("loader", samples, 6).unwrap().shuffled(true);
        let signal = Signal::new();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        loader.initialize(&mut InitContext::new(&Device::Cpu, &signal)).unwrap();
        loader.run(&mut RunContext::new(&mut rng, &signal)).unwrap();

        let mut seen = loader.minibatch_data.read().data.clone();
        seen.sort_by(f32::total_cmp);
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }
}
