//! Dense row-major `f32` tensors.

use crate::error::{GradwireError, Result};

/// A dense gradient (or memory) tensor.
///
/// Data is stored row-major. The optional name is the parameter name and is
/// only consulted by name-based [`Selection`](crate::reducer::Selection).
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    name: Option<String>,
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Build a tensor from a shape and matching data.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<Self> {
        let shape = shape.into();
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            return Err(GradwireError::BufferSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            name: None,
            shape,
            data,
        })
    }

    /// A zero-filled tensor.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let n = shape.iter().product::<usize>();
        Self {
            name: None,
            shape,
            data: vec![0.0; n],
        }
    }

    /// A zero-filled tensor with the same shape (and name) as `other`.
    pub fn zeros_like(other: &Tensor) -> Self {
        Self {
            name: other.name.clone(),
            shape: other.shape.clone(),
            data: vec![0.0; other.data.len()],
        }
    }

    /// Attach a parameter name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn nelement(&self) -> usize {
        self.data.len()
    }

    /// Bytes per element.
    pub fn element_size(&self) -> usize {
        std::mem::size_of::<f32>()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Matrix view dimensions `(shape[0], nelement / shape[0])`.
    ///
    /// Scalars and empty leading dimensions view as a single row.
    pub fn matrix_dims(&self) -> (usize, usize) {
        match self.shape.first() {
            Some(&rows) if rows > 0 => (rows, self.data.len() / rows),
            _ => (1, self.data.len()),
        }
    }

    /// Overwrite the contents with `src`, which must have the same length.
    pub fn copy_from_slice(&mut self, src: &[f32]) -> Result<()> {
        if src.len() != self.data.len() {
            return Err(GradwireError::BufferSizeMismatch {
                expected: self.data.len(),
                actual: src.len(),
            });
        }
        self.data.copy_from_slice(src);
        Ok(())
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// L1 norm of all elements.
    pub fn l1_norm(&self) -> f32 {
        self.data.iter().map(|v| v.abs()).sum()
    }
}

/// Check that `grad_out` and `memory_out` line up with `grad_in`.
pub(crate) fn check_aligned(
    grad_in: &[Tensor],
    grad_out: &[Tensor],
    memory_out: &[Tensor],
) -> Result<()> {
    for other in [grad_out, memory_out] {
        if other.len() != grad_in.len() {
            return Err(GradwireError::count_mismatch(grad_in.len(), other.len()));
        }
        for (index, (a, b)) in grad_in.iter().zip(other).enumerate() {
            if a.shape() != b.shape() {
                return Err(GradwireError::ShapeMismatch {
                    index,
                    expected: a.shape().to_vec(),
                    actual: b.shape().to_vec(),
                });
            }
        }
    }
    Ok(())
}

/// `memory = input - output`, element-wise.
pub(crate) fn write_residual(input: &Tensor, output: &Tensor, memory: &mut Tensor) {
    for ((m, &x), &y) in memory.data.iter_mut().zip(&input.data).zip(&output.data) {
        *m = x - y;
    }
}
