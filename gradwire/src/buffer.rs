//! Flat packing of many tensors into one contiguous buffer.
//!
//! Reducers exchange one buffer per payload kind instead of one message
//! per tensor. The layout (offsets and shapes) is fixed at construction and
//! is reused to decode buffers received from other workers.

use crate::bits::n_bits;
use crate::comm::{CollectiveHandle, Communicator};
use crate::error::{GradwireError, Result};
use crate::tensor::Tensor;

/// Many tensors flattened into one `Vec<f32>`.
#[derive(Debug, Clone)]
pub struct TensorBuffer {
    buffer: Vec<f32>,
    offsets: Vec<(usize, usize)>,
    shapes: Vec<Vec<usize>>,
}

impl TensorBuffer {
    /// Copy-concatenate `tensors`. Offsets come from `nelement()` alone.
    pub fn new<'a>(tensors: impl IntoIterator<Item = &'a Tensor>) -> Self {
        let mut buffer = Vec::new();
        let mut offsets = Vec::new();
        let mut shapes = Vec::new();
        for t in tensors {
            let start = buffer.len();
            buffer.extend_from_slice(t.data());
            offsets.push((start, buffer.len()));
            shapes.push(t.shape().to_vec());
        }
        Self {
            buffer,
            offsets,
            shapes,
        }
    }

    /// Number of packed tensors.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Total element count.
    pub fn nelement(&self) -> usize {
        self.buffer.len()
    }

    pub fn element_size(&self) -> usize {
        std::mem::size_of::<f32>()
    }

    /// Bits needed to send the flat buffer.
    pub fn bits(&self) -> u64 {
        n_bits(&self.buffer)
    }

    /// Segment `i` of the flat buffer.
    pub fn get(&self, i: usize) -> &[f32] {
        let (start, end) = self.offsets[i];
        &self.buffer[start..end]
    }

    pub fn shape(&self, i: usize) -> &[usize] {
        &self.shapes[i]
    }

    pub fn buffer(&self) -> &[f32] {
        &self.buffer
    }

    /// Replace the flat storage, keeping the layout.
    pub fn set_buffer(&mut self, buffer: Vec<f32>) -> Result<()> {
        if buffer.len() != self.buffer.len() {
            return Err(GradwireError::BufferSizeMismatch {
                expected: self.buffer.len(),
                actual: buffer.len(),
            });
        }
        self.buffer = buffer;
        Ok(())
    }

    /// Re-copy `tensors` into their existing segments.
    pub fn pack<'a>(&mut self, tensors: impl IntoIterator<Item = &'a Tensor>) -> Result<()> {
        let mut count = 0;
        for (i, t) in tensors.into_iter().enumerate() {
            let Some(&(start, end)) = self.offsets.get(i) else {
                return Err(GradwireError::count_mismatch(self.len(), i + 1));
            };
            if t.nelement() != end - start {
                return Err(GradwireError::ShapeMismatch {
                    index: i,
                    expected: self.shapes[i].clone(),
                    actual: t.shape().to_vec(),
                });
            }
            self.buffer[start..end].copy_from_slice(t.data());
            count += 1;
        }
        if count != self.len() {
            return Err(GradwireError::count_mismatch(self.len(), count));
        }
        Ok(())
    }

    /// Copy each segment into the matching destination tensor.
    pub fn unpack<'a>(&self, destinations: impl IntoIterator<Item = &'a mut Tensor>) -> Result<()> {
        let mut count = 0;
        for (i, dst) in destinations.into_iter().enumerate() {
            let Some(shape) = self.shapes.get(i) else {
                return Err(GradwireError::count_mismatch(self.len(), i + 1));
            };
            if dst.shape() != shape.as_slice() {
                return Err(GradwireError::ShapeMismatch {
                    index: i,
                    expected: shape.clone(),
                    actual: dst.shape().to_vec(),
                });
            }
            dst.data_mut().copy_from_slice(self.get(i));
            count += 1;
        }
        if count != self.len() {
            return Err(GradwireError::count_mismatch(self.len(), count));
        }
        Ok(())
    }

    /// In-place multiply.
    pub fn scale(&mut self, factor: f32) {
        for v in &mut self.buffer {
            *v *= factor;
        }
    }

    /// Sum the flat buffer across workers, in place.
    pub async fn all_reduce(&mut self, comm: &Communicator) -> Result<()> {
        comm.all_reduce(&mut self.buffer).await
    }

    /// Every worker's flat buffer, in rank order.
    pub async fn all_gather(&self, comm: &Communicator) -> Result<Vec<Vec<f32>>> {
        comm.all_gather(&self.buffer).await
    }

    /// Start a non-blocking sum of this buffer across workers.
    pub fn all_reduce_nb(self, comm: &Communicator) -> PendingBuffer {
        let Self {
            buffer,
            offsets,
            shapes,
        } = self;
        PendingBuffer {
            handle: comm.all_reduce_nb(buffer),
            offsets,
            shapes,
        }
    }
}

/// A [`TensorBuffer`] whose all-reduce is in flight.
pub struct PendingBuffer {
    handle: CollectiveHandle<Vec<f32>>,
    offsets: Vec<(usize, usize)>,
    shapes: Vec<Vec<usize>>,
}

impl PendingBuffer {
    /// Wait for the all-reduce and hand back the reduced buffer.
    pub async fn wait(self) -> Result<TensorBuffer> {
        let buffer = self.handle.wait().await?;
        Ok(TensorBuffer {
            buffer,
            offsets: self.offsets,
            shapes: self.shapes,
        })
    }
}
