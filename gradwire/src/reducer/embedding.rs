//! Exact reducers specialised for sparse embedding gradients.
//!
//! Embedding gradients are mostly zero rows. Every mode here reproduces the
//! exact mean, so memory is always zero; they differ in what travels.

use super::{Passthrough, ReducerContext, ReducerKind, Selection, pick, pick_mut};
use crate::bits::n_bits;
use crate::error::{GradwireError, Result};
use crate::tensor::Tensor;
use crate::types::Rank;

/// Bytes per sparse coordinate on the wire: `i64` index plus `f32` value.
const COORDINATE_BYTES: usize = 8 + 4;

/// How embedding gradients are exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedExchange {
    /// All-reduce a bitmap of non-zero rows, then all-reduce only the rows
    /// non-zero on some worker.
    RowBitmap,
    /// All-gather `(index, value)` pairs padded to the largest count.
    Coordinates,
    /// Coordinates when the summed sparse payload is smaller than a dense
    /// all-reduce, dense otherwise.
    Adaptive,
    /// Gather coordinates at rank 0, which broadcasts the concatenation.
    GatherBroadcast,
}

/// Non-zero entries as flat indices and values.
fn coordinates(data: &[f32]) -> (Vec<i64>, Vec<f32>) {
    data.iter()
        .enumerate()
        .filter(|&(_, &x)| x != 0.0)
        .map(|(i, &x)| (i as i64, x))
        .unzip()
}

/// Add `value / n` at every index into `out`.
fn scatter_mean(out: &mut [f32], indices: &[i64], values: &[f32], n: f32) -> Result<()> {
    let len = out.len();
    for (&i, &v) in indices.iter().zip(values) {
        let slot = usize::try_from(i)
            .ok()
            .and_then(|i| out.get_mut(i))
            .ok_or(GradwireError::BufferSizeMismatch {
                expected: len,
                actual: i.max(0) as usize + 1,
            })?;
        *slot += v / n;
    }
    Ok(())
}

/// Exact reducer for the selected embedding tensors. Everything else takes
/// the exact passthrough.
#[derive(Debug)]
pub struct SparseEmbedReducer {
    pub(super) ctx: ReducerContext,
    exchange: EmbedExchange,
    selection: Selection,
}

impl SparseEmbedReducer {
    pub fn new(ctx: ReducerContext, exchange: EmbedExchange, selection: Option<Selection>) -> Self {
        Self {
            ctx,
            exchange,
            selection: selection.unwrap_or_else(Selection::embeddings),
        }
    }

    pub fn exchange(&self) -> EmbedExchange {
        self.exchange
    }

    pub(super) fn kind(&self) -> ReducerKind {
        match self.exchange {
            EmbedExchange::RowBitmap => ReducerKind::OmniEmbed,
            EmbedExchange::Coordinates => ReducerKind::ExactEmbed,
            EmbedExchange::Adaptive => ReducerKind::SparCml,
            EmbedExchange::GatherBroadcast => ReducerKind::Parallax,
        }
    }

    pub(super) async fn reduce(
        &mut self,
        grad_in: &[Tensor],
        grad_out: &mut [Tensor],
        memory_out: &mut [Tensor],
    ) -> Result<u64> {
        let mask = self.selection.classify(grad_in)?;
        let passthrough = {
            let _t = self.ctx.timer().begin("reduce.rank1.pack", 1);
            Passthrough::start(&self.ctx, pick(grad_in, &mask, false))
        };
        let mut bits = passthrough.bits();

        let compressed: Vec<&Tensor> = pick(grad_in, &mask, true).collect();
        let mut outs: Vec<&mut Tensor> = pick_mut(grad_out, &mask, true).collect();
        bits += match self.exchange {
            EmbedExchange::RowBitmap => self.row_bitmap(&compressed, &mut outs).await?,
            _ => {
                let mut bits = 0;
                for (tensor, out) in compressed.iter().zip(outs.iter_mut()) {
                    bits += match self.exchange {
                        EmbedExchange::GatherBroadcast => self.gather_broadcast(tensor, out).await?,
                        _ => self.all_gather_coordinates(tensor, out).await?,
                    };
                }
                bits
            }
        };

        for mem in memory_out.iter_mut() {
            mem.fill(0.0);
        }
        passthrough
            .finish(&self.ctx, pick_mut(grad_out, &mask, false))
            .await?;
        Ok(bits)
    }

    async fn row_bitmap(&self, tensors: &[&Tensor], outs: &mut [&mut Tensor]) -> Result<u64> {
        let dims: Vec<(usize, usize)> = tensors.iter().map(|t| t.matrix_dims()).collect();
        let mut bitmap = {
            let _t = self.ctx.timer().begin("reduce.construct_bitmap", 1);
            let mut bitmap = Vec::with_capacity(dims.iter().map(|d| d.0).sum());
            for (t, &(rows, row_len)) in tensors.iter().zip(&dims) {
                bitmap.extend((0..rows).map(|i| {
                    let row = &t.data()[i * row_len..(i + 1) * row_len];
                    if row.iter().any(|&x| x != 0.0) { 1.0f32 } else { 0.0 }
                }));
            }
            bitmap
        };
        let mut bits = n_bits(&bitmap);
        {
            let _t = self.ctx.timer().begin("reduce.sync_bitmap", 2);
            self.ctx.comm().all_reduce(&mut bitmap).await?;
        }

        // Rows non-zero on any worker, packed tensor by tensor.
        let mut rows_packed = Vec::new();
        let mut offset = 0;
        for (t, &(rows, row_len)) in tensors.iter().zip(&dims) {
            for i in 0..rows {
                if bitmap[offset + i] != 0.0 {
                    rows_packed.extend_from_slice(&t.data()[i * row_len..(i + 1) * row_len]);
                }
            }
            offset += rows;
        }
        bits += n_bits(&rows_packed);
        {
            let _t = self.ctx.timer().begin("reduce.sync_rows", 2);
            self.ctx.comm().all_reduce(&mut rows_packed).await?;
        }

        let n = self.ctx.n_workers() as f32;
        let mut sums = rows_packed.into_iter();
        let mut offset = 0;
        for (out, &(rows, row_len)) in outs.iter_mut().zip(&dims) {
            out.fill(0.0);
            let data = out.data_mut();
            for i in 0..rows {
                if bitmap[offset + i] == 0.0 {
                    continue;
                }
                for v in &mut data[i * row_len..(i + 1) * row_len] {
                    *v = sums.next().unwrap_or(0.0) / n;
                }
            }
            offset += rows;
        }
        Ok(bits)
    }

    /// Coordinate exchange through all-gather. In adaptive mode a dense
    /// all-reduce is used when it is cheaper; the choice depends only on the
    /// gathered counts, so every worker takes the same branch.
    async fn all_gather_coordinates(&self, tensor: &Tensor, out: &mut Tensor) -> Result<u64> {
        let comm = self.ctx.comm();
        let n = self.ctx.n_workers() as f32;
        let (mut indices, mut values) = coordinates(tensor.data());
        let nnz = [indices.len() as i64];
        let counts = {
            let _t = self.ctx.timer().begin("reduce.setup_allgather", 1);
            comm.all_gather(&nnz).await?
        };
        let mut bits = n_bits(&nnz);

        if self.exchange == EmbedExchange::Adaptive {
            let total: usize = counts.iter().map(|c| c[0] as usize).sum();
            let dense_bytes = self.ctx.n_workers() * tensor.nelement() * tensor.element_size();
            if total * COORDINATE_BYTES >= dense_bytes {
                tracing::trace!(total, dense_bytes, "sparcml: dense all-reduce");
                let mut dense = tensor.data().to_vec();
                bits += n_bits(&dense);
                comm.all_reduce(&mut dense).await?;
                for (o, v) in out.data_mut().iter_mut().zip(dense) {
                    *o = v / n;
                }
                return Ok(bits);
            }
        }

        let max_nnz = counts.iter().map(|c| c[0] as usize).max().unwrap_or(0);
        indices.resize(max_nnz, 0);
        values.resize(max_nnz, 0.0);
        bits += n_bits(&indices) + n_bits(&values);
        let (all_indices, all_values) = {
            let _t = self.ctx.timer().begin("reduce.allgather", 2);
            tokio::try_join!(comm.all_gather(&indices), comm.all_gather(&values))?
        };

        out.fill(0.0);
        for (idx, vals) in all_indices.iter().zip(&all_values) {
            scatter_mean(out.data_mut(), idx, vals, n)?;
        }
        Ok(bits)
    }

    /// Coordinates gathered at rank 0, concatenated there and broadcast.
    async fn gather_broadcast(&self, tensor: &Tensor, out: &mut Tensor) -> Result<u64> {
        const ROOT: Rank = 0;
        let comm = self.ctx.comm();
        let (indices, values) = coordinates(tensor.data());
        let bits = n_bits(&indices) + n_bits(&values);

        let (gathered_indices, gathered_values) = {
            let _t = self.ctx.timer().begin("reduce.gather", 2);
            tokio::try_join!(comm.gather(&indices, ROOT), comm.gather(&values, ROOT))?
        };
        let mut all_indices: Vec<i64> = gathered_indices.map(|g| g.concat()).unwrap_or_default();
        let mut all_values: Vec<f32> = gathered_values.map(|g| g.concat()).unwrap_or_default();
        {
            let _t = self.ctx.timer().begin("reduce.broadcast", 2);
            tokio::try_join!(
                comm.broadcast(&mut all_indices, ROOT),
                comm.broadcast(&mut all_values, ROOT)
            )?;
        }

        out.fill(0.0);
        scatter_mean(out.data_mut(), &all_indices, &all_values, self.ctx.n_workers() as f32)?;
        Ok(bits)
    }
}
