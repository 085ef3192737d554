//! TopK sparsification: keep the largest-magnitude entries.

use super::ReducerContext;
use crate::bits::n_bits;
use crate::buffer::TensorBuffer;
use crate::error::{GradwireError, Result};
use crate::tensor::Tensor;

/// Indices of the `k` largest `|values|`, in ascending index order.
///
/// Ties keep the lower index first.
pub(crate) fn top_indices(values: &[f32], k: usize) -> Vec<usize> {
    let mut by_mag: Vec<usize> = (0..values.len()).collect();
    by_mag.sort_by(|&a, &b| values[b].abs().total_cmp(&values[a].abs()));
    by_mag.truncate(k.min(values.len()));
    // Sort for deterministic wire order.
    by_mag.sort_unstable();
    by_mag
}

/// `max(1, ⌊0.5 · compression · n⌋)`, never more than `n`.
fn top_size(compression: f64, n: usize) -> usize {
    ((0.5 * compression * n as f64) as usize).max(1).min(n)
}

fn check_compression(compression: f64) -> Result<()> {
    if !(compression > 0.0 && compression <= 1.0) {
        return Err(GradwireError::config(format!(
            "compression must be in (0, 1], got {compression}"
        )));
    }
    Ok(())
}

/// Per-tensor TopK. Each worker sends `(value, position)` pairs; positions
/// chosen by several workers accumulate independently.
#[derive(Debug)]
pub struct TopKReducer {
    pub(super) ctx: ReducerContext,
    compression: f64,
}

impl TopKReducer {
    pub fn new(ctx: ReducerContext, compression: f64) -> Result<Self> {
        check_compression(compression)?;
        Ok(Self { ctx, compression })
    }

    pub(super) async fn reduce(
        &mut self,
        grad_in: &[Tensor],
        grad_out: &mut [Tensor],
        memory_out: &mut [Tensor],
    ) -> Result<u64> {
        let mut segments = Vec::with_capacity(grad_in.len());
        let mut flat_values = Vec::new();
        let mut flat_positions: Vec<i32> = Vec::new();
        {
            let _t = self.ctx.timer().begin("reduce.topk", 2);
            for tensor in grad_in {
                let k = top_size(self.compression, tensor.nelement());
                let start = flat_values.len();
                for i in top_indices(tensor.data(), k) {
                    flat_values.push(tensor.data()[i]);
                    flat_positions.push(i as i32);
                }
                segments.push(start..flat_values.len());
            }
        }

        {
            let _t = self.ctx.timer().begin("reduce.memory", 2);
            for ((tensor, mem), range) in grad_in.iter().zip(memory_out.iter_mut()).zip(&segments) {
                mem.copy_from_slice(tensor.data())?;
                for &p in &flat_positions[range.clone()] {
                    mem.data_mut()[p as usize] = 0.0;
                }
            }
        }

        let bits = n_bits(&flat_values) + n_bits(&flat_positions);
        let (worker_values, worker_positions) = {
            let _t = self.ctx.timer().begin("reduce.gather", 2);
            let comm = self.ctx.comm();
            tokio::try_join!(comm.all_gather(&flat_values), comm.all_gather(&flat_positions))?
        };

        let _t = self.ctx.timer().begin("reduce.combine", 2);
        let n = self.ctx.n_workers() as f32;
        for (out, range) in grad_out.iter_mut().zip(&segments) {
            out.fill(0.0);
            let data = out.data_mut();
            for (values, positions) in worker_values.iter().zip(&worker_positions) {
                for (&v, &p) in values[range.clone()].iter().zip(&positions[range.clone()]) {
                    data[p as usize] += v / n;
                }
            }
        }
        Ok(bits)
    }
}

/// TopK over the whole parameter set concatenated. Positions are global
/// offsets into the flattened set.
#[derive(Debug)]
pub struct GlobalTopKReducer {
    pub(super) ctx: ReducerContext,
    compression: f64,
}

impl GlobalTopKReducer {
    pub fn new(ctx: ReducerContext, compression: f64) -> Result<Self> {
        check_compression(compression)?;
        Ok(Self { ctx, compression })
    }

    pub(super) async fn reduce(
        &mut self,
        grad_in: &[Tensor],
        grad_out: &mut [Tensor],
        memory_out: &mut [Tensor],
    ) -> Result<u64> {
        let mut flat = {
            let _t = self.ctx.timer().begin("reduce.flatpack", 1);
            TensorBuffer::new(grad_in)
        };
        let total = flat.nelement();

        let (values, positions) = {
            let _t = self.ctx.timer().begin("reduce.topk", 2);
            let k = top_size(self.compression, total);
            let selected = top_indices(flat.buffer(), k);
            let values: Vec<f32> = selected.iter().map(|&i| flat.buffer()[i]).collect();
            let positions: Vec<i64> = selected.iter().map(|&i| i as i64).collect();
            (values, positions)
        };

        {
            let _t = self.ctx.timer().begin("reduce.set_memory", 2);
            let mut residual = flat.buffer().to_vec();
            for &p in &positions {
                residual[p as usize] = 0.0;
            }
            flat.set_buffer(residual)?;
            flat.unpack(memory_out.iter_mut())?;
        }

        let bits = n_bits(&values) + n_bits(&positions);
        let (worker_values, worker_positions) = {
            let _t = self.ctx.timer().begin("reduce.reduce", 2);
            let comm = self.ctx.comm();
            tokio::try_join!(comm.all_gather(&values), comm.all_gather(&positions))?
        };

        let _t = self.ctx.timer().begin("reduce.combine", 2);
        let n = self.ctx.n_workers() as f32;
        let mut combined = vec![0.0f32; total];
        for (vals, pos) in worker_values.iter().zip(&worker_positions) {
            for (&v, &p) in vals.iter().zip(pos) {
                let slot = combined.get_mut(p as usize).ok_or(GradwireError::BufferSizeMismatch {
                    expected: total,
                    actual: p as usize + 1,
                })?;
                *slot += v / n;
            }
        }
        flat.set_buffer(combined)?;
        flat.unpack(grad_out.iter_mut())?;
        Ok(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_indices_distinct_magnitudes() {
        let v = [0.1, -5.0, 3.0, 0.2, -4.0, 1.0];
        assert_eq!(top_indices(&v, 3), vec![1, 2, 4]);
        assert_eq!(top_indices(&v, 10).len(), 6);
    }

    #[test]
    fn test_top_indices_ties_keep_lower_index() {
        let v = [1.0, -1.0, 1.0, 0.5];
        assert_eq!(top_indices(&v, 2), vec![0, 1]);
    }

    #[test]
    fn test_top_size_formula() {
        assert_eq!(top_size(1.0 / 244.0, 100), 1);
        assert_eq!(top_size(0.5, 100), 25);
        assert_eq!(top_size(1.0, 3), 1);
        assert_eq!(top_size(1.0, 0), 0);
    }

    #[test]
    fn test_rejects_bad_compression() {
        assert!(TopKReducer::new(ReducerContext::solo(0), 0.0).is_err());
        assert!(GlobalTopKReducer::new(ReducerContext::solo(0), 1.5).is_err());
    }

    #[tokio::test]
    async fn test_topk_single_worker_selection() {
        // compression 0.5 on 8 elements keeps 2.
        let g = vec![Tensor::new([2, 4], vec![0.1, -9.0, 0.3, 2.0, 7.0, -0.2, 0.0, 1.0]).unwrap()];
        let mut out = vec![Tensor::zeros([2, 4])];
        let mut mem = vec![Tensor::zeros([2, 4])];
        let mut r = TopKReducer::new(ReducerContext::solo(0), 0.5).unwrap();
        let bits = r.reduce(&g, &mut out, &mut mem).await.unwrap();
        assert_eq!(out[0].data(), &[0.0, -9.0, 0.0, 0.0, 7.0, 0.0, 0.0, 0.0]);
        assert_eq!(mem[0].data(), &[0.1, 0.0, 0.3, 2.0, 0.0, -0.2, 0.0, 1.0]);
        assert_eq!(bits, 2 * 32 + 2 * 32);
    }

    #[tokio::test]
    async fn test_global_topk_spans_tensors() {
        // 10 elements total at compression 0.4 keeps 2, both in the second tensor.
        let g = vec![
            Tensor::new([4], vec![0.1, 0.2, 0.3, 0.4]).unwrap(),
            Tensor::new([2, 3], vec![5.0, 0.0, 0.0, 0.0, -6.0, 0.0]).unwrap(),
        ];
        let mut out: Vec<Tensor> = g.iter().map(Tensor::zeros_like).collect();
        let mut mem: Vec<Tensor> = g.iter().map(Tensor::zeros_like).collect();
        let mut r = GlobalTopKReducer::new(ReducerContext::solo(0), 0.4).unwrap();
        let bits = r.reduce(&g, &mut out, &mut mem).await.unwrap();
        assert!(out[0].data().iter().all(|&v| v == 0.0));
        assert_eq!(out[1].data(), &[5.0, 0.0, 0.0, 0.0, -6.0, 0.0]);
        assert_eq!(mem[0].data(), g[0].data());
        assert!(mem[1].data().iter().all(|&v| v == 0.0));
        assert_eq!(bits, 2 * 32 + 2 * 64);
    }
}
