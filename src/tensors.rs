//! Row-major batch buffers.
//!
//! # Batches
//!
//! Units exchange numeric data as [`Tensor`]s: a shape plus flat row-major
//! data. The first dimension is the *capacity* of a batch (the number of
//! sample rows the buffer can hold); the product of the remaining dimensions
//! is the *sample size*. How many rows are actually valid in the current pass
//! is published separately as a `batch_size` attribute, and rows past it are
//! kept zeroed by whoever writes the buffer.
//!
//! ## Limitations
//! - Row-major only
//! - No broadcasting, slicing, or shape inference
//!
//! ## Example
//!
//! ```rust
//! use briny_flow::tensors::Tensor;
//! let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! assert_eq!(t.rows(), 2);
//! assert_eq!(t.sample_size(), 3);
//! assert_eq!(t.row(1), &[4.0, 5.0, 6.0]);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowResult};

/// An N-dimensional tensor with a shape and flat row-major data.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tensor<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

impl<T> Tensor<T> {
    /// Creates a new tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self { shape, data }
    }

    /// Fallible [`Tensor::new`], for shapes that come from outside the crate.
    pub fn try_new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> FlowResult<Self> {
        let shape = shape.into();
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(FlowError::shape(
                "tensor",
                format!("shape {:?} needs {expected} elements, got {}", shape, data.len()),
            ));
        }
        Ok(Self { shape, data })
    }

    /// Number of sample rows (the first dimension, or 0 for a scalar shape).
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Elements per row.
    pub fn sample_size(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    pub fn row(&self, i: usize) -> &[T] {
        let n = self.sample_size();
        &self.data[i * n..(i + 1) * n]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [T] {
        let n = self.sample_size();
        &mut self.data[i * n..(i + 1) * n]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<T: Clone + Default> Tensor<T> {
    /// A tensor of the given shape filled with `T::default()`.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![T::default(); len],
        }
    }

    /// Resets every row from `from` onwards to `T::default()`.
    pub fn clear_rows_from(&mut self, from: usize) {
        let start = (from * self.sample_size()).min(self.data.len());
        self.data[start..].fill(T::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_panics() {
        let result = std::panic::catch_unwind(|| {
            Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0]);
        });
        assert!(result.is_err());
    }

    #[test]
    fn try_new_reports_mismatch() {
        let err = Tensor::try_new(vec![3, 2], vec![0.0f32; 5]).unwrap_err();
        assert!(matches!(err, FlowError::ShapeMismatch { .. }));
    }

    #[test]
    fn rows_and_clearing() {
        let mut t = Tensor::new(vec![3, 2], vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]);
        t.row_mut(0)[1] = 9.0;
        t.clear_rows_from(2);
        assert_eq!(t.data, vec![1.0, 9.0, 3.0, 4.0, 0.0, 0.0]);
        assert_eq!(Tensor::<f32>::zeros(vec![4]).sample_size(), 1);
    }
}
