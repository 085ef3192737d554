//! Low-rank compression by one step of power iteration (`M ≈ P·Qᵀ`).

use super::{Passthrough, ReducerContext, ReducerKind, Selection, pick, pick_mut, zero_memory};
use crate::bits::n_bits;
use crate::error::{GradwireError, Result};
use crate::linalg;
use crate::tensor::{Tensor, write_residual};
use rand::Rng;
use std::borrow::Cow;

/// Candidate masks drawn by the sparse variant on its first call.
const SPARSE_MASK_CANDIDATES: usize = 10;

/// Rank of the factorization, for every tensor or per tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RankSpec {
    Uniform(usize),
    /// One rank per gradient, in gradient order. Entries for tensors that
    /// are not compressed are ignored.
    PerTensor(Vec<usize>),
}

impl RankSpec {
    fn validate(&self) -> Result<()> {
        let ok = match self {
            RankSpec::Uniform(r) => *r > 0,
            RankSpec::PerTensor(ranks) => ranks.iter().all(|&r| r > 0),
        };
        if !ok {
            return Err(GradwireError::config("rank must be at least 1"));
        }
        Ok(())
    }
}

/// Where one tensor's factors live in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct FactorSlot {
    pub rows: usize,
    pub cols: usize,
    pub rank: usize,
    p_offset: usize,
    q_offset: usize,
}

/// Flat storage for every compressed tensor's `P (rows×rank)` and
/// `Q (cols×rank)`, laid out once on first use and reused every step.
#[derive(Debug)]
pub(super) struct FactorArena {
    p: Vec<f32>,
    q: Vec<f32>,
    slots: Vec<FactorSlot>,
}

impl FactorArena {
    /// Lay out factors for `(rows, cols, rank)` triples, rank already clamped.
    pub(super) fn plan(dims: impl IntoIterator<Item = (usize, usize, usize)>) -> Vec<FactorSlot> {
        let (mut p_offset, mut q_offset) = (0, 0);
        dims.into_iter()
            .map(|(rows, cols, rank)| {
                let slot = FactorSlot {
                    rows,
                    cols,
                    rank,
                    p_offset,
                    q_offset,
                };
                p_offset += rows * rank;
                q_offset += cols * rank;
                slot
            })
            .collect()
    }

    pub(super) fn new(slots: Vec<FactorSlot>) -> Self {
        let p_len = slots.iter().map(|s| s.rows * s.rank).sum();
        let q_len = slots.iter().map(|s| s.cols * s.rank).sum();
        tracing::debug!(tensors = slots.len(), p_len, q_len, "allocated factor memory");
        Self {
            p: vec![0.0; p_len],
            q: vec![0.0; q_len],
            slots,
        }
    }

    /// Parameter shapes must not change between steps.
    pub(super) fn check_layout(&self, slots: &[FactorSlot]) -> Result<()> {
        if slots.len() != self.slots.len() {
            return Err(GradwireError::count_mismatch(self.slots.len(), slots.len()));
        }
        for (index, (have, want)) in self.slots.iter().zip(slots).enumerate() {
            if have != want {
                return Err(GradwireError::ShapeMismatch {
                    index,
                    expected: vec![have.rows, have.cols, have.rank],
                    actual: vec![want.rows, want.cols, want.rank],
                });
            }
        }
        Ok(())
    }

    pub(super) fn p(&self, i: usize) -> &[f32] {
        let s = &self.slots[i];
        &self.p[s.p_offset..s.p_offset + s.rows * s.rank]
    }

    pub(super) fn q(&self, i: usize) -> &[f32] {
        let s = &self.slots[i];
        &self.q[s.q_offset..s.q_offset + s.cols * s.rank]
    }

    /// `P_i` and `Q_i` of one tensor, both mutable.
    pub(super) fn factors_mut(&mut self, i: usize) -> (&mut [f32], &mut [f32]) {
        let s = self.slots[i];
        (
            &mut self.p[s.p_offset..s.p_offset + s.rows * s.rank],
            &mut self.q[s.q_offset..s.q_offset + s.cols * s.rank],
        )
    }

    pub(super) fn p_flat_mut(&mut self) -> &mut [f32] {
        &mut self.p
    }

    pub(super) fn q_flat_mut(&mut self) -> &mut [f32] {
        &mut self.q
    }

    /// `out = P_i · Q_iᵀ`.
    pub(super) fn outer(&self, i: usize, out: &mut [f32]) {
        let s = self.slots[i];
        linalg::matmul_nt(self.p(i), self.q(i), out, s.rows, s.rank, s.cols);
    }
}

/// Random masks zeroed before factorization by the sparse variant.
#[derive(Debug)]
struct SparseMasks {
    sparsity: f64,
    /// `candidates[c][t]`: indices of tensor `t` zeroed by candidate `c`.
    candidates: Option<Vec<Vec<Vec<usize>>>>,
}

impl SparseMasks {
    /// Copies of `tensors` with one candidate mask zeroed.
    fn apply(&mut self, ctx: &mut ReducerContext, tensors: &[&Tensor]) -> Result<Vec<Vec<f32>>> {
        let sparsity = self.sparsity;
        let candidates = self.candidates.get_or_insert_with(|| {
            tracing::debug!(sparsity, "drawing sparse masks");
            (0..SPARSE_MASK_CANDIDATES)
                .map(|_| {
                    tensors
                        .iter()
                        .map(|t| {
                            let n = t.nelement();
                            ctx.sample_indices(n, (sparsity * n as f64) as usize)
                        })
                        .collect()
                })
                .collect()
        });
        let chosen = &candidates[ctx.rng().gen_range(0..SPARSE_MASK_CANDIDATES)];
        if chosen.len() != tensors.len() {
            return Err(GradwireError::count_mismatch(chosen.len(), tensors.len()));
        }
        Ok(tensors
            .iter()
            .zip(chosen)
            .map(|(t, indices)| {
                let mut data = t.data().to_vec();
                for &i in indices {
                    data[i] = 0.0;
                }
                data
            })
            .collect())
    }
}

/// Rank-`r` power-iteration reducer and its per-tensor and sparse
/// variants.
///
/// Tensors outside the selection take the exact passthrough, which runs
/// as a non-blocking all-reduce while the factors are computed.
#[derive(Debug)]
pub struct RankKReducer {
    pub(super) ctx: ReducerContext,
    ranks: RankSpec,
    reuse_query: bool,
    selection: Selection,
    sparse: Option<SparseMasks>,
    factors: Option<FactorArena>,
}

impl RankKReducer {
    pub fn new(
        ctx: ReducerContext,
        ranks: RankSpec,
        reuse_query: bool,
        selection: Option<Selection>,
    ) -> Result<Self> {
        ranks.validate()?;
        Ok(Self {
            ctx,
            ranks,
            reuse_query,
            selection: selection.unwrap_or(Selection::Matrices),
            sparse: None,
            factors: None,
        })
    }

    /// Zero a random `sparsity` fraction of every compressed tensor before
    /// factorizing it. The zeroed entries stay in memory.
    pub fn sparse(
        ctx: ReducerContext,
        rank: usize,
        reuse_query: bool,
        sparsity: f64,
        selection: Option<Selection>,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&sparsity) {
            return Err(GradwireError::config(format!(
                "sparsity must be in [0, 1], got {sparsity}"
            )));
        }
        let mut reducer = Self::new(ctx, RankSpec::Uniform(rank), reuse_query, selection)?;
        reducer.sparse = Some(SparseMasks {
            sparsity,
            candidates: None,
        });
        Ok(reducer)
    }

    pub(super) fn kind(&self) -> ReducerKind {
        match (&self.ranks, &self.sparse) {
            (_, Some(_)) => ReducerKind::RankKSparse,
            (RankSpec::PerTensor(_), None) => ReducerKind::MultiRankK,
            (RankSpec::Uniform(_), None) => ReducerKind::RankK,
        }
    }

    /// `(rows, cols, rank)` of every compressed tensor, rank clamped to the
    /// matrix.
    fn factor_dims(&self, grad_in: &[Tensor], mask: &[bool]) -> Result<Vec<(usize, usize, usize)>> {
        if let RankSpec::PerTensor(ranks) = &self.ranks {
            if ranks.len() != grad_in.len() {
                return Err(GradwireError::count_mismatch(grad_in.len(), ranks.len()));
            }
        }
        Ok(grad_in
            .iter()
            .enumerate()
            .filter(|&(i, _)| mask[i])
            .map(|(i, t)| {
                let (rows, cols) = t.matrix_dims();
                let rank = match &self.ranks {
                    RankSpec::Uniform(r) => *r,
                    RankSpec::PerTensor(ranks) => ranks[i],
                };
                (rows, cols, rank.min(rows).min(cols))
            })
            .collect())
    }

    pub(super) async fn reduce(
        &mut self,
        grad_in: &[Tensor],
        grad_out: &mut [Tensor],
        memory_out: &mut [Tensor],
    ) -> Result<u64> {
        let mask = self.selection.classify(grad_in)?;
        let slots = FactorArena::plan(self.factor_dims(grad_in, &mask)?);
        let timer = self.ctx.timer().clone();
        let mut bits = 0;

        let fresh = self.factors.is_none();
        let arena = self.factors.get_or_insert_with(|| FactorArena::new(slots.clone()));
        arena.check_layout(&slots)?;

        let compressed: Vec<&Tensor> = pick(grad_in, &mask, true).collect();
        let matrices: Vec<Cow<'_, [f32]>> = match &mut self.sparse {
            Some(masks) => {
                let _t = timer.begin("reduce.sparse_before_power", 1);
                masks
                    .apply(&mut self.ctx, &compressed)?
                    .into_iter()
                    .map(Cow::Owned)
                    .collect()
            }
            None => compressed.iter().map(|t| Cow::Borrowed(t.data())).collect(),
        };

        if !(self.reuse_query && !fresh) {
            let _t = timer.begin("reduce.prepare.q", 1);
            for i in 0..slots.len() {
                let (_, q) = arena.factors_mut(i);
                self.ctx.fill_normal(q);
            }
        }

        {
            let _t = timer.begin("reduce.compute.p", 1);
            for (i, m) in matrices.iter().enumerate() {
                let s = slots[i];
                let (p, q) = arena.factors_mut(i);
                linalg::matmul(m, q, p, s.rows, s.cols, s.rank);
            }
        }

        {
            let _t = timer.begin("reduce.p", 2);
            let p = arena.p_flat_mut();
            self.ctx.comm().all_reduce(&mut *p).await?;
            bits += n_bits(p);
        }

        let passthrough = {
            let _t = timer.begin("reduce.rank1.all_reduce", 2);
            Passthrough::start(&self.ctx, pick(grad_in, &mask, false))
        };
        bits += passthrough.bits();
        zero_memory(memory_out, &mask, false);

        {
            let _t = timer.begin("reduce.normalize.p", 1);
            for (i, s) in slots.iter().enumerate() {
                let (p, _) = arena.factors_mut(i);
                linalg::orthogonalize(p, s.rows, s.rank);
            }
        }

        {
            let _t = timer.begin("reduce.compute.q", 1);
            for (i, m) in matrices.iter().enumerate() {
                let s = slots[i];
                let (p, q) = arena.factors_mut(i);
                linalg::matmul_tn(m, p, q, s.rows, s.cols, s.rank);
            }
        }

        {
            let _t = timer.begin("reduce.q", 2);
            let q = arena.q_flat_mut();
            self.ctx.comm().all_reduce(&mut *q).await?;
            bits += n_bits(q);
            let n = self.ctx.n_workers() as f32;
            for v in q.iter_mut() {
                *v /= n;
            }
        }

        {
            let _t = timer.begin("reduce.outerprod", 1);
            let outs = pick_mut(grad_out, &mask, true);
            let mems = pick_mut(memory_out, &mask, true);
            for (i, ((tensor, out), mem)) in compressed.iter().zip(outs).zip(mems).enumerate() {
                arena.outer(i, out.data_mut());
                write_residual(tensor, out, mem);
            }
        }

        passthrough
            .finish(&self.ctx, pick_mut(grad_out, &mask, false))
            .await?;
        Ok(bits)
    }
}
