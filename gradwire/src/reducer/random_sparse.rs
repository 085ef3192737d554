//! Random sparsification with positions drawn from the shared RNG.
//!
//! Every worker draws the same positions, so only the values travel and
//! they can be summed with a plain all-reduce.

use super::{ReducerContext, ReducerKind};
use crate::error::{GradwireError, Result};
use crate::tensor::Tensor;
use rand::Rng;

/// How many entries of a tensor are sent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SparseSize {
    /// `max(1, ⌊fraction · nelement⌋)`.
    Fraction(f64),
    /// `rank · (rows + cols)` of the matrix view, the same budget as a
    /// rank-`r` factorization.
    RankProportional(usize),
}

impl SparseSize {
    fn of(self, tensor: &Tensor) -> usize {
        let n = tensor.nelement();
        let size = match self {
            SparseSize::Fraction(f) => ((f * n as f64) as usize).max(1),
            SparseSize::RankProportional(rank) => {
                let (rows, cols) = tensor.matrix_dims();
                rank * (rows + cols)
            }
        };
        size.min(n)
    }
}

/// Sends a random subset (or a random wrap-around block) of each tensor.
#[derive(Debug)]
pub struct RandomSparseReducer {
    pub(super) ctx: ReducerContext,
    size: SparseSize,
    block: bool,
}

impl RandomSparseReducer {
    pub fn new(ctx: ReducerContext, size: SparseSize, block: bool) -> Result<Self> {
        match size {
            SparseSize::Fraction(f) if !(f > 0.0 && f <= 1.0) => {
                return Err(GradwireError::config(format!(
                    "compression must be in (0, 1], got {f}"
                )));
            }
            SparseSize::RankProportional(0) => {
                return Err(GradwireError::config("rank must be at least 1"));
            }
            _ => {}
        }
        Ok(Self { ctx, size, block })
    }

    pub(super) fn kind(&self) -> ReducerKind {
        match (self.size, self.block) {
            (SparseSize::Fraction(_), false) => ReducerKind::UniformRandomSparse,
            (SparseSize::Fraction(_), true) => ReducerKind::UniformRandomSparseBlock,
            (SparseSize::RankProportional(_), false) => ReducerKind::RandomSparse,
            (SparseSize::RankProportional(_), true) => ReducerKind::RandomSparseBlock,
        }
    }

    /// Positions to send for one tensor. A size that covers the tensor
    /// takes everything without touching the RNG.
    fn positions(&mut self, tensor: &Tensor) -> Vec<usize> {
        let n = tensor.nelement();
        let k = self.size.of(tensor);
        if k == n {
            return (0..n).collect();
        }
        if self.block {
            let start = self.ctx.rng().gen_range(0..n);
            (0..k).map(|i| (start + i) % n).collect()
        } else {
            self.ctx.sample_indices(n, k)
        }
    }

    pub(super) async fn reduce(
        &mut self,
        grad_in: &[Tensor],
        grad_out: &mut [Tensor],
        memory_out: &mut [Tensor],
    ) -> Result<u64> {
        let timer = self.ctx.timer().clone();

        let mut positions = Vec::with_capacity(grad_in.len());
        let mut flat_values = Vec::new();
        {
            let _t = timer.begin("reduce.block", 2);
            for tensor in grad_in {
                let idx = self.positions(tensor);
                flat_values.extend(idx.iter().map(|&i| tensor.data()[i]));
                positions.push(idx);
            }
        }

        {
            let _t = timer.begin("reduce.memory", 2);
            for ((tensor, mem), idx) in grad_in.iter().zip(memory_out.iter_mut()).zip(&positions) {
                mem.copy_from_slice(tensor.data())?;
                let data = mem.data_mut();
                for &i in idx {
                    data[i] = 0.0;
                }
            }
        }

        let bits = crate::bits::n_bits(&flat_values);
        {
            let _t = timer.begin("reduce.reduce", 2);
            self.ctx.comm().all_reduce(&mut flat_values).await?;
            let n = self.ctx.n_workers() as f32;
            for v in &mut flat_values {
                *v /= n;
            }
        }

        let _t = timer.begin("reduce.combine", 2);
        let mut values = flat_values.into_iter();
        for (out, idx) in grad_out.iter_mut().zip(&positions) {
            out.fill(0.0);
            let data = out.data_mut();
            for (&i, v) in idx.iter().zip(values.by_ref()) {
                data[i] = v;
            }
        }
        Ok(bits)
    }
}
