//! Evaluators: score a batch of network outputs and produce the error that
//! is propagated back.
//!
//! Both evaluators are [`AcceleratedUnit`](crate::ops::dispatch::AcceleratedUnit)s
//! and are added to a graph wrapped in
//! [`Accelerated`](crate::ops::dispatch::Accelerated).

mod mse;
mod softmax;

pub use mse::{EvaluatorMse, MseMetrics};
pub use softmax::EvaluatorSoftmax;

use crate::attr::Slot;
use crate::error::{FlowError, FlowResult};

/// Error scale: `1 / batch_size` when averaging, `1` otherwise.
pub(crate) fn multiplier(averaged: bool, batch_size: usize) -> f32 {
    if averaged && batch_size > 0 {
        1.0 / batch_size as f32
    } else {
        1.0
    }
}

/// Reads the bound batch size and checks it against the buffer capacity.
pub(crate) fn batch_size(unit: &str, slot: &Slot<usize>, capacity: usize) -> FlowResult<usize> {
    let batch_size = slot.get(unit)?.get();
    if batch_size > capacity {
        return Err(FlowError::shape(
            unit,
            format!("batch size {batch_size} exceeds the buffer capacity {capacity}"),
        ));
    }
    Ok(batch_size)
}

/// Checks that `labels` covers the batch capacity and every used label is a class index.
pub(crate) fn check_labels(
    unit: &str,
    labels: &[i32],
    batch_size: usize,
    capacity: usize,
    classes: usize,
) -> FlowResult<()> {
    if labels.len() != capacity {
        return Err(FlowError::shape(
            unit,
            format!("{} labels for a batch capacity of {capacity}", labels.len()),
        ));
    }
    if let Some(bad) = labels[..batch_size].iter().find(|&&l| l >= classes as i32) {
        return Err(FlowError::shape(
            unit,
            format!("label {bad} out of range for {classes} classes"),
        ));
    }
    Ok(())
}
