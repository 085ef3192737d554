//! Count-sketch compression of embedding gradients.

use super::{Passthrough, ReducerContext, Selection, pick, pick_mut, zero_memory};
use crate::bits::n_bits;
use crate::error::{GradwireError, Result};
use crate::tensor::Tensor;
use rand::Rng;
use rand::rngs::StdRng;

/// Bucket and sign hashes of one tensor's sketch, drawn once.
#[derive(Debug)]
struct SketchHashes {
    rows: usize,
    cols: usize,
    /// Elements covered, `n · m` of the matrix view.
    len: usize,
    /// `buckets[r * len + j]`: column of coordinate `j` in sketch row `r`.
    buckets: Vec<u32>,
    /// `signs[r * len + j]` is `+1` or `-1`.
    signs: Vec<f32>,
}

impl SketchHashes {
    fn draw(rng: &mut StdRng, rows: usize, cols: usize, len: usize) -> Self {
        let buckets = (0..rows * len).map(|_| rng.gen_range(0..cols as u32)).collect();
        let signs = (0..rows * len)
            .map(|_| if rng.r#gen::<bool>() { 1.0 } else { -1.0 })
            .collect();
        Self {
            rows,
            cols,
            len,
            buckets,
            signs,
        }
    }

    fn table_len(&self) -> usize {
        self.rows * self.cols
    }

    /// Add `data` into `table (rows × cols)`.
    fn encode(&self, data: &[f32], table: &mut [f32]) {
        table.fill(0.0);
        for r in 0..self.rows {
            let hashes = r * self.len..(r + 1) * self.len;
            let row = &mut table[r * self.cols..(r + 1) * self.cols];
            for ((&x, &b), &s) in data
                .iter()
                .zip(&self.buckets[hashes.clone()])
                .zip(&self.signs[hashes])
            {
                if x != 0.0 {
                    row[b as usize] += s * x;
                }
            }
        }
    }

    /// Median estimate of coordinate `j` over the sketch rows.
    fn estimate(&self, table: &[f32], j: usize, scratch: &mut Vec<f32>) -> f32 {
        scratch.clear();
        for r in 0..self.rows {
            let h = r * self.len + j;
            scratch.push(self.signs[h] * table[r * self.cols + self.buckets[h] as usize]);
        }
        scratch.sort_by(f32::total_cmp);
        let mid = scratch.len() / 2;
        if scratch.len() % 2 == 1 {
            scratch[mid]
        } else {
            0.5 * (scratch[mid - 1] + scratch[mid])
        }
    }

    /// Decode rows flagged in `bitmap`; every other row is zero.
    fn decode(&self, table: &[f32], bitmap: &[f32], row_len: usize, out: &mut [f32]) {
        let mut scratch = Vec::with_capacity(self.rows);
        for (i, &flag) in bitmap.iter().enumerate() {
            let row = &mut out[i * row_len..(i + 1) * row_len];
            if flag == 0.0 {
                row.fill(0.0);
                continue;
            }
            for (c, v) in row.iter_mut().enumerate() {
                *v = self.estimate(table, i * row_len + c, &mut scratch);
            }
        }
    }
}

/// 1.0 for every row of `data (rows × row_len)` holding a non-zero.
fn row_bitmap(data: &[f32], rows: usize, row_len: usize, out: &mut [f32]) {
    for (i, flag) in out.iter_mut().enumerate().take(rows) {
        let row = &data[i * row_len..(i + 1) * row_len];
        *flag = if row.iter().any(|&x| x != 0.0) { 1.0 } else { 0.0 };
    }
}

/// Sends a count sketch of each selected (embedding) tensor plus a bitmap
/// of its non-zero rows. The other tensors take the exact passthrough.
///
/// A sketch has `sketch_rows` rows of `max(1, ⌊n·m·sparsity·rank⌋)`
/// columns. Hashes come from the shared RNG, so every worker's sketch
/// uses the same buckets and tables can be summed.
#[derive(Debug)]
pub struct SketchEmbedReducer {
    pub(super) ctx: ReducerContext,
    rank: usize,
    sparsity: f64,
    sketch_rows: usize,
    selection: Selection,
    hashes: Option<Vec<SketchHashes>>,
}

impl SketchEmbedReducer {
    pub fn new(
        ctx: ReducerContext,
        rank: usize,
        sparsity: f64,
        sketch_rows: usize,
        selection: Option<Selection>,
    ) -> Result<Self> {
        if rank == 0 {
            return Err(GradwireError::config("rank must be at least 1"));
        }
        if sketch_rows == 0 {
            return Err(GradwireError::config("sketch needs at least one row"));
        }
        if !(sparsity > 0.0 && sparsity <= 1.0) {
            return Err(GradwireError::config(format!(
                "sparsity must be in (0, 1], got {sparsity}"
            )));
        }
        Ok(Self {
            ctx,
            rank,
            sparsity,
            sketch_rows,
            selection: selection.unwrap_or_else(Selection::embeddings),
            hashes: None,
        })
    }

    fn sketch_cols(&self, len: usize) -> usize {
        ((len as f64 * self.sparsity * self.rank as f64) as usize).max(1)
    }

    pub(super) async fn reduce(
        &mut self,
        grad_in: &[Tensor],
        grad_out: &mut [Tensor],
        memory_out: &mut [Tensor],
    ) -> Result<u64> {
        let mask = self.selection.classify(grad_in)?;
        let timer = self.ctx.timer().clone();
        let compressed: Vec<&Tensor> = pick(grad_in, &mask, true).collect();

        if self.hashes.is_none() {
            let _t = timer.begin("reduce.setup_sketch", 1);
            let mut drawn = Vec::with_capacity(compressed.len());
            for t in &compressed {
                let cols = self.sketch_cols(t.nelement());
                drawn.push(SketchHashes::draw(self.ctx.rng(), self.sketch_rows, cols, t.nelement()));
            }
            tracing::debug!(tensors = drawn.len(), rows = self.sketch_rows, "drew sketch hashes");
            self.hashes = Some(drawn);
        }
        let hashes = self.hashes.as_deref().unwrap_or_default();
        if hashes.len() != compressed.len() {
            return Err(GradwireError::count_mismatch(hashes.len(), compressed.len()));
        }
        for (index, (h, t)) in hashes.iter().zip(&compressed).enumerate() {
            if h.len != t.nelement() {
                return Err(GradwireError::ShapeMismatch {
                    index,
                    expected: vec![h.len],
                    actual: vec![t.nelement()],
                });
            }
        }

        let table_offsets: Vec<usize> = hashes
            .iter()
            .scan(0, |off, h| {
                let start = *off;
                *off += h.table_len();
                Some(start)
            })
            .collect();
        let bitmap_offsets: Vec<usize> = compressed
            .iter()
            .scan(0, |off, t| {
                let start = *off;
                *off += t.matrix_dims().0;
                Some(start)
            })
            .collect();
        let mut tables = vec![0.0f32; hashes.iter().map(SketchHashes::table_len).sum()];
        let mut bitmaps = vec![0.0f32; compressed.iter().map(|t| t.matrix_dims().0).sum()];

        {
            let _t = timer.begin("reduce.construct_sketch", 1);
            for (i, (t, h)) in compressed.iter().zip(hashes).enumerate() {
                let (rows, row_len) = t.matrix_dims();
                h.encode(t.data(), &mut tables[table_offsets[i]..table_offsets[i] + h.table_len()]);
                row_bitmap(t.data(), rows, row_len, &mut bitmaps[bitmap_offsets[i]..bitmap_offsets[i] + rows]);
            }
        }

        {
            let _t = timer.begin("reduce.fill_memory", 1);
            for (i, (t, mem)) in compressed
                .iter()
                .zip(pick_mut(memory_out, &mask, true))
                .enumerate()
            {
                let h = &hashes[i];
                let (rows, row_len) = t.matrix_dims();
                h.decode(
                    &tables[table_offsets[i]..table_offsets[i] + h.table_len()],
                    &bitmaps[bitmap_offsets[i]..bitmap_offsets[i] + rows],
                    row_len,
                    mem.data_mut(),
                );
                for (m, &x) in mem.data_mut().iter_mut().zip(t.data()) {
                    *m = x - *m;
                }
            }
        }
        zero_memory(memory_out, &mask, false);

        let mut bits = n_bits(&tables) + n_bits(&bitmaps);
        {
            let _t = timer.begin("reduce.sync_sketch", 1);
            let comm = self.ctx.comm();
            tokio::try_join!(comm.all_reduce(&mut tables), comm.all_reduce(&mut bitmaps))?;
            let n = self.ctx.n_workers() as f32;
            for v in &mut tables {
                *v /= n;
            }
        }

        let passthrough = Passthrough::start(&self.ctx, pick(grad_in, &mask, false));
        bits += passthrough.bits();

        {
            let _t = timer.begin("reduce.unsketch", 1);
            for (i, out) in pick_mut(grad_out, &mask, true).enumerate() {
                let h = &hashes[i];
                let (rows, row_len) = compressed[i].matrix_dims();
                h.decode(
                    &tables[table_offsets[i]..table_offsets[i] + h.table_len()],
                    &bitmaps[bitmap_offsets[i]..bitmap_offsets[i] + rows],
                    row_len,
                    out.data_mut(),
                );
            }
        }

        passthrough
            .finish(&self.ctx, pick_mut(grad_out, &mask, false))
            .await?;
        Ok(bits)
    }
}
