use super::rank_k::FactorArena;
use super::{Passthrough, ReducerContext, Selection, pick, pick_mut, zero_memory};
use crate::bits::n_bits;
use crate::error::{GradwireError, Result};
use crate::linalg;
use crate::tensor::Tensor;

/// Which factor the next call recomputes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HalfStep {
    P,
    Q,
}

/// Rank-`r` power iteration spread over two calls: one call recomputes
/// and reduces `P` from the previous `Q`, the next recomputes `Q` from
/// that `P`. Each step sends one factor per tensor.
#[derive(Debug)]
pub struct HalfRankKReducer {
    pub(super) ctx: ReducerContext,
    rank: usize,
    selection: Selection,
    next: HalfStep,
    factors: Option<FactorArena>,
}

impl HalfRankKReducer {
    pub fn new(ctx: ReducerContext, rank: usize, selection: Option<Selection>) -> Result<Self> {
        if rank == 0 {
            return Err(GradwireError::config("rank must be at least 1"));
        }
        Ok(Self {
            ctx,
            rank,
            selection: selection.unwrap_or(Selection::Matrices),
            next: HalfStep::P,
            factors: None,
        })
    }

    pub(super) async fn reduce(
        &mut self,
        grad_in: &[Tensor],
        grad_out: &mut [Tensor],
        memory_out: &mut [Tensor],
    ) -> Result<u64> {
        let mask = self.selection.classify(grad_in)?;
        let timer = self.ctx.timer().clone();
        let n = self.ctx.n_workers() as f32;

        let passthrough = Passthrough::start(&self.ctx, pick(grad_in, &mask, false));
        let mut bits = passthrough.bits();
        zero_memory(memory_out, &mask, false);

        let compressed: Vec<&Tensor> = pick(grad_in, &mask, true).collect();
        let rank = self.rank;
        let slots = FactorArena::plan(compressed.iter().map(|t| {
            let (rows, cols) = t.matrix_dims();
            (rows, cols, rank.min(rows).min(cols))
        }));
        let fresh = self.factors.is_none();
        let arena = self.factors.get_or_insert_with(|| FactorArena::new(slots.clone()));
        arena.check_layout(&slots)?;

        let step = self.next;
        self.next = match step {
            HalfStep::P => HalfStep::Q,
            HalfStep::Q => HalfStep::P,
        };

        match step {
            HalfStep::P => {
                {
                    let _t = timer.begin("reduce.normalize.q", 2);
                    for (i, s) in slots.iter().enumerate() {
                        let (_, q) = arena.factors_mut(i);
                        if fresh {
                            self.ctx.fill_normal(q);
                        }
                        linalg::orthogonalize(q, s.cols, s.rank);
                    }
                }
                {
                    let _t = timer.begin("reduce.compute.p", 2);
                    for (i, tensor) in compressed.iter().enumerate() {
                        let s = slots[i];
                        let (p, q) = arena.factors_mut(i);
                        linalg::matmul(tensor.data(), q, p, s.rows, s.cols, s.rank);
                    }
                }
            }
            HalfStep::Q => {
                {
                    let _t = timer.begin("reduce.normalize.p", 2);
                    for (i, s) in slots.iter().enumerate() {
                        let (p, _) = arena.factors_mut(i);
                        linalg::orthogonalize(p, s.rows, s.rank);
                    }
                }
                {
                    let _t = timer.begin("reduce.compute.q", 2);
                    for (i, tensor) in compressed.iter().enumerate() {
                        let s = slots[i];
                        let (p, q) = arena.factors_mut(i);
                        linalg::matmul_tn(tensor.data(), p, q, s.rows, s.cols, s.rank);
                    }
                }
            }
        }

        // Residual against the local factors, before they are reduced.
        {
            let _t = timer.begin("reduce.fill_memory", 2);
            for (i, (tensor, mem)) in compressed
                .iter()
                .zip(pick_mut(memory_out, &mask, true))
                .enumerate()
            {
                arena.outer(i, mem.data_mut());
                for (m, &x) in mem.data_mut().iter_mut().zip(tensor.data()) {
                    *m = x - *m;
                }
            }
        }

        {
            let (name, flat) = match step {
                HalfStep::P => ("reduce.p", arena.p_flat_mut()),
                HalfStep::Q => ("reduce.q", arena.q_flat_mut()),
            };
            let _t = timer.begin(name, 2);
            self.ctx.comm().all_reduce(&mut *flat).await?;
            bits += n_bits(flat);
            for v in flat.iter_mut() {
                *v /= n;
            }
        }

        {
            let _t = timer.begin("reduce.outerprod", 2);
            for (i, out) in pick_mut(grad_out, &mask, true).enumerate() {
                arena.outer(i, out.data_mut());
            }
        }

        passthrough
            .finish(&self.ctx, pick_mut(grad_out, &mask, false))
            .await?;
        Ok(bits)
    }
}
