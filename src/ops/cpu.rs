//! CPU backend kernels.
//!
//! Sequential reference implementations of every accelerated unit, plus the
//! double precision reference workload used by device benchmarking (the only
//! kernel here that uses `rayon`, since it also serves as the CPU's
//! contestant in the device ranking).
//!
//! Buffers follow the layout of [`Tensor`]: row-major, first dimension is
//! the batch capacity. Rows at and beyond `batch_size` are written as zero.

use rayon::prelude::*;

use crate::tensors::Tensor;

/// Scalars produced by [`evaluate_softmax`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SoftmaxStats {
    /// Samples with a non-negative label whose argmax differs from it.
    pub n_err: u32,
    /// Largest `sum |err|` over evaluated samples.
    pub max_err: f32,
}

/// Index of the largest element; the first one on ties.
pub fn argmax(row: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

/// Classification error of a softmax output batch.
///
/// For every row `i < batch_size` with `labels[i] >= 0`:
/// `err_output[i] = (output[i] - one_hot(labels[i])) * multiplier` and
/// `confusion[argmax(output[i]) * Y + labels[i]] += 1`. Rows with a negative
/// label and rows past `batch_size` get a zero error and are not counted.
///
/// Labels must already be checked to be `< Y`.
pub fn evaluate_softmax(
    output: &Tensor<f32>,
    labels: &[i32],
    batch_size: usize,
    multiplier: f32,
    err_output: &mut Tensor<f32>,
    confusion: &mut [u32],
) -> SoftmaxStats {
    let y = output.sample_size();
    let mut stats = SoftmaxStats::default();

    for i in 0..batch_size {
        let err = err_output.row_mut(i);
        let Ok(label) = usize::try_from(labels[i]) else {
            err.fill(0.0);
            continue;
        };
        let out = output.row(i);

        let best = argmax(out);
        confusion[best * y + label] += 1;
        if best != label {
            stats.n_err += 1;
        }

        let mut sum = 0.0f32;
        for (j, (e, &o)) in err.iter_mut().zip(out).enumerate() {
            let target = if j == label { 1.0 } else { 0.0 };
            *e = (o - target) * multiplier;
            sum += e.abs();
        }
        stats.max_err = stats.max_err.max(sum);
    }
    err_output.clear_rows_from(batch_size);

    stats
}

/// Per-sample mean squared error of `output` against `target`.
///
/// Writes `err_output = (output - target) * multiplier` and
/// `mse[i] = sum((output[i] - target[i])^2) / Y`, square-rooted unless
/// `squared`. Rows past `batch_size` are zeroed in both.
pub fn evaluate_mse(
    output: &Tensor<f32>,
    target: &Tensor<f32>,
    batch_size: usize,
    multiplier: f32,
    squared: bool,
    err_output: &mut Tensor<f32>,
    mse: &mut [f32],
) {
    let y = output.sample_size();

    for i in 0..batch_size {
        let mut sq = 0.0f32;
        for ((e, &o), &t) in err_output.row_mut(i).iter_mut().zip(output.row(i)).zip(target.row(i)) {
            let d = o - t;
            sq += d * d;
            *e = d * multiplier;
        }
        let m = sq / y as f32;
        mse[i] = if squared { m } else { m.sqrt() };
    }
    err_output.clear_rows_from(batch_size);
    let len = mse.len();
    mse[batch_size.min(len)..].fill(0.0);
}

/// Index of the class target closest (euclidean) to `sample`.
pub fn nearest_class(sample: &[f32], class_targets: &Tensor<f32>) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for c in 0..class_targets.rows() {
        let dist: f32 = class_targets
            .row(c)
            .iter()
            .zip(sample)
            .map(|(&t, &s)| (t - s) * (t - s))
            .sum();
        if dist < best_dist {
            best_dist = dist;
            best = c;
        }
    }
    best
}

/// Counts samples whose nearest class target differs from their label.
/// Samples with a negative label are not counted.
pub fn count_misclassified(
    output: &Tensor<f32>,
    labels: &[i32],
    batch_size: usize,
    class_targets: &Tensor<f32>,
) -> u32 {
    (0..batch_size)
        .filter(|&i| labels[i] >= 0)
        .filter(|&i| nearest_class(output.row(i), class_targets) as i64 != i64::from(labels[i]))
        .count() as u32
}

/// `c = 1.7159 * tanh(0.6666 * (a x b^T + bias))` in double precision.
///
/// `a` is `[a_height, width]`, `b` is `[b_height, width]`, `bias` has
/// `b_height` elements; the result is `[a_height, b_height]`.
pub fn feed_tanh(a: &[f64], b: &[f64], bias: &[f64], width: usize) -> Vec<f64> {
    let b_height = bias.len();
    let a_height = if width == 0 { 0 } else { a.len() / width };
    let mut c = vec![0.0; a_height * b_height];

    c.par_chunks_mut(b_height.max(1))
        .enumerate()
        .for_each(|(row, out)| {
            let a_row = &a[row * width..(row + 1) * width];
            for (col, value) in out.iter_mut().enumerate() {
                let b_row = &b[col * width..(col + 1) * width];
                let dot: f64 = a_row.iter().zip(b_row).map(|(x, y)| x * y).sum();
                *value = 1.7159 * (0.6666 * (dot + bias[col])).tanh();
            }
        });

    c
}
