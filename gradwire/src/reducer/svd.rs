//! Reducers built on a full singular value decomposition.

use super::{ReducerContext, Selection, pick, pick_mut, reduce_mean_list, zero_memory};
use crate::bits::n_bits;
use crate::error::{GradwireError, Result};
use crate::linalg::{self, Svd};
use crate::tensor::Tensor;
use rand::Rng;

/// Rejection-sampling attempts before Atomo gives up.
pub const ATOMO_MAX_ATTEMPTS: usize = 1000;

fn check_rank(rank: usize) -> Result<()> {
    if rank == 0 {
        return Err(GradwireError::config("rank must be at least 1"));
    }
    Ok(())
}

/// Average of `U·diag(S)·Vᵀ` over every worker's factors, written into `out`.
fn average_reconstructions(
    out: &mut [f32],
    factors: impl Iterator<Item = (Vec<f32>, Vec<f32>, Vec<f32>)>,
    rows: usize,
    cols: usize,
    n_workers: usize,
) {
    out.fill(0.0);
    let scale = 1.0 / n_workers as f32;
    for (u, s, v) in factors {
        let recon = linalg::reconstruct(&u, &s, &v, rows, cols);
        for (o, r) in out.iter_mut().zip(recon) {
            *o += scale * r;
        }
    }
}

/// Truncated SVD of each selected tensor. Every worker all-gathers the
/// `(U, S, V)` triples and averages the reconstructions.
///
/// Tensors outside the selection are reduced exactly with zero memory.
#[derive(Debug)]
pub struct SvdReducer {
    pub(super) ctx: ReducerContext,
    rank: usize,
    selection: Selection,
}

impl SvdReducer {
    pub fn new(ctx: ReducerContext, rank: usize, selection: Option<Selection>) -> Result<Self> {
        check_rank(rank)?;
        Ok(Self {
            ctx,
            rank,
            selection: selection.unwrap_or(Selection::Matrices),
        })
    }

    pub(super) async fn reduce(
        &mut self,
        grad_in: &[Tensor],
        grad_out: &mut [Tensor],
        memory_out: &mut [Tensor],
    ) -> Result<u64> {
        let mask = self.selection.classify(grad_in)?;
        let mut bits = 0;

        {
            let _t = self.ctx.timer().begin("reduce.rank1", 2);
            zero_memory(memory_out, &mask, false);
            bits += reduce_mean_list(
                &self.ctx,
                pick(grad_in, &mask, false),
                pick_mut(grad_out, &mask, false),
            )
            .await?;
        }

        let compressed = pick(grad_in, &mask, true)
            .zip(pick_mut(grad_out, &mask, true))
            .zip(pick_mut(memory_out, &mask, true));
        for ((tensor, out), mem) in compressed {
            let (rows, cols) = tensor.matrix_dims();
            let d = {
                let _t = self.ctx.timer().begin("reduce.svd", 2);
                linalg::svd(tensor.data(), rows, cols).truncate(self.rank)
            };

            let local = linalg::reconstruct(&d.u, &d.s, &d.v, rows, cols);
            for ((m, &x), r) in mem.data_mut().iter_mut().zip(tensor.data()).zip(&local) {
                *m = x - r;
            }

            let comm = self.ctx.comm();
            let (us, ss, vs) = {
                let _t = self.ctx.timer().begin("reduce.gather", 2);
                tokio::try_join!(comm.all_gather(&d.u), comm.all_gather(&d.s), comm.all_gather(&d.v))?
            };
            bits += n_bits(&d.u) + n_bits(&d.s) + n_bits(&d.v);

            average_reconstructions(
                out.data_mut(),
                us.into_iter().zip(ss).zip(vs).map(|((u, s), v)| (u, s, v)),
                rows,
                cols,
                self.ctx.n_workers(),
            );
        }
        Ok(bits)
    }
}

/// Matrix view used by Atomo.
///
/// 1-D tensors of even length fold into two columns, odd ones stay a
/// column. Tensors whose trailing dimensions are all 1 use the first two.
/// Otherwise the first two dimensions are merged and halved when that
/// divides the element count.
pub(crate) fn atomo_dims(shape: &[usize]) -> (usize, usize) {
    let n: usize = shape.iter().product();
    match *shape {
        [] => (1, 1),
        [len] if len > 0 && len % 2 == 0 => (len / 2, 2),
        [len] => (len, 1),
        [s0, s1, ref rest @ ..] if rest.iter().all(|&d| d == 1) => (s0, s1),
        [s0, s1, ..] => {
            let half = s0 * s1 / 2;
            if (s0 * s1) % 2 == 0 && half > 0 && n % half == 0 {
                (half, n / half)
            } else {
                (s0, n / s0.max(1))
            }
        }
    }
}

/// Importance-sampled SVD (Atomo).
///
/// Singular value `i` is kept with probability `p_i = min(1, rank·|σ_i| / Σ|σ|)`
/// and rescaled by `1 / p_i`, which makes the reconstruction unbiased.
/// Samples are redrawn until exactly `rank` indices are kept.
#[derive(Debug)]
pub struct AtomoReducer {
    pub(super) ctx: ReducerContext,
    rank: usize,
}

impl AtomoReducer {
    pub fn new(ctx: ReducerContext, rank: usize) -> Result<Self> {
        check_rank(rank)?;
        Ok(Self { ctx, rank })
    }

    fn probabilities(&self, sigma: &[f32]) -> Vec<f32> {
        let total: f32 = sigma.iter().map(|s| s.abs()).sum();
        sigma
            .iter()
            .map(|s| (self.rank as f32 * s.abs() / total).min(1.0))
            .collect()
    }

    /// Indices kept by one successful attempt, with their probabilities.
    fn sample(&mut self, probs: &[f32]) -> Result<Vec<usize>> {
        for _ in 0..ATOMO_MAX_ATTEMPTS {
            let rng = self.ctx.rng();
            let pick: Vec<usize> = probs
                .iter()
                .enumerate()
                .filter(|&(_, &p)| p > rng.r#gen::<f32>())
                .map(|(i, _)| i)
                .collect();
            if pick.len() == self.rank {
                return Ok(pick);
            }
        }
        Err(GradwireError::SamplingExhausted {
            wanted: self.rank,
            attempts: ATOMO_MAX_ATTEMPTS,
        })
    }

    /// Sampled and rescaled triples of one tensor.
    fn encode(&mut self, tensor: &Tensor) -> Result<(Vec<f32>, Vec<f32>, Vec<f32>)> {
        if tensor.nelement() == 0 {
            return Ok((Vec::new(), Vec::new(), Vec::new()));
        }
        let (rows, cols) = atomo_dims(tensor.shape());
        let rank = self.rank;
        if rank > rows.min(cols) {
            return Err(GradwireError::InvalidRank { rank, rows, cols });
        }
        let d: Svd = linalg::svd(tensor.data(), rows, cols);
        if d.s.iter().all(|&s| s == 0.0) {
            tracing::warn!(rows, cols, "atomo: all-zero tensor, sending zero factors");
            return Ok((vec![0.0; rows * rank], vec![0.0; rank], vec![0.0; cols * rank]));
        }
        let probs = self.probabilities(&d.s);
        let picked = self.sample(&probs)?;
        let u = linalg::take_columns(&d.u, rows, d.k, &picked);
        let v = linalg::take_columns(&d.v, cols, d.k, &picked);
        let s = picked.iter().map(|&i| d.s[i] / probs[i]).collect();
        Ok((u, s, v))
    }

    pub(super) async fn reduce(
        &mut self,
        grad_in: &[Tensor],
        grad_out: &mut [Tensor],
        memory_out: &mut [Tensor],
    ) -> Result<u64> {
        let timer = self.ctx.timer().clone();

        let mut encoded = Vec::with_capacity(grad_in.len());
        {
            let _t = timer.begin("reduce.encode", 2);
            for tensor in grad_in {
                encoded.push(self.encode(tensor)?);
            }
        }

        {
            let _t = timer.begin("reduce.memory", 2);
            for ((tensor, mem), (u, s, v)) in grad_in.iter().zip(memory_out.iter_mut()).zip(&encoded) {
                let (rows, cols) = atomo_dims(tensor.shape());
                let local = linalg::reconstruct(u, s, v, rows, cols);
                for ((m, &x), r) in mem.data_mut().iter_mut().zip(tensor.data()).zip(local) {
                    *m = x - r;
                }
            }
        }

        // Layout: every U, then every S, then every V.
        let mut packed = Vec::new();
        for (u, _, _) in &encoded {
            packed.extend_from_slice(u);
        }
        for (_, s, _) in &encoded {
            packed.extend_from_slice(s);
        }
        for (_, _, v) in &encoded {
            packed.extend_from_slice(v);
        }
        let bits = n_bits(&packed);

        let gathered = {
            let _t = timer.begin("reduce.allgather", 2);
            self.ctx.comm().all_gather(&packed).await?
        };

        let _t = timer.begin("reduce.average", 2);
        let n = self.ctx.n_workers() as f32;
        for out in grad_out.iter_mut() {
            out.fill(0.0);
        }
        for buffer in &gathered {
            let u_len: usize = encoded.iter().map(|(u, _, _)| u.len()).sum();
            let s_len: usize = encoded.iter().map(|(_, s, _)| s.len()).sum();
            let (mut u_off, mut s_off, mut v_off) = (0, u_len, u_len + s_len);
            for (out, (u, s, v)) in grad_out.iter_mut().zip(&encoded) {
                let (rows, cols) = atomo_dims(out.shape());
                let wu = &buffer[u_off..u_off + u.len()];
                let ws = &buffer[s_off..s_off + s.len()];
                let wv = &buffer[v_off..v_off + v.len()];
                u_off += u.len();
                s_off += s.len();
                v_off += v.len();
                let recon = linalg::reconstruct(wu, ws, wv, rows, cols);
                for (o, r) in out.data_mut().iter_mut().zip(recon) {
                    *o += r / n;
                }
            }
        }
        Ok(bits)
    }
}
