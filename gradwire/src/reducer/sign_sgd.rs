//! Sign-based reducers. Each worker sends one bit per coordinate.

use super::ReducerContext;
use crate::bits::n_bits;
use crate::buffer::TensorBuffer;
use crate::error::Result;
use crate::sign::{SignCompressor, sign_of};
use crate::tensor::Tensor;

/// `memory = x - scale * codec_sign(x)` per tensor.
fn write_sign_residual(grad_in: &[Tensor], memory_out: &mut [Tensor], scales: &[f32]) {
    for ((tensor, mem), &scale) in grad_in.iter().zip(memory_out.iter_mut()).zip(scales) {
        for (m, &x) in mem.data_mut().iter_mut().zip(tensor.data()) {
            *m = x - scale * sign_of(x);
        }
    }
}

/// Pack all gradients, compress to signs and all-gather the packed words.
async fn gather_signs(
    ctx: &ReducerContext,
    codec: &SignCompressor,
    flat: &TensorBuffer,
) -> Result<(Vec<Vec<u32>>, u64)> {
    let words = {
        let _t = ctx.timer().begin("reduce.compress", 2);
        codec.compress_slice(flat.buffer())
    };
    let bits = n_bits(&words);
    let _t = ctx.timer().begin("reduce.gather", 2);
    let gathered = ctx.comm().all_gather(&words).await?;
    Ok((gathered, bits))
}

/// Output is the mean of every worker's signs.
#[derive(Debug)]
pub struct SignReducer {
    pub(super) ctx: ReducerContext,
    codec: SignCompressor,
}

impl SignReducer {
    pub fn new(ctx: ReducerContext) -> Result<Self> {
        Ok(Self {
            ctx,
            codec: SignCompressor::new()?,
        })
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
        let len = flat.nelement();
        let (gathered, bits) = gather_signs(&self.ctx, &self.codec, &flat).await?;

        {
            let _t = self.ctx.timer().begin("reduce.average", 2);
            let n = self.ctx.n_workers() as f32;
            let mut avg = vec![0.0f32; len];
            for words in &gathered {
                let signs = self.codec.uncompress_slice(words, len)?;
                for (a, s) in avg.iter_mut().zip(signs) {
                    *a += s;
                }
            }
            for a in &mut avg {
                *a /= n;
            }
            flat.set_buffer(avg)?;
            flat.unpack(grad_out.iter_mut())?;
        }

        let _t = self.ctx.timer().begin("reduce.memory", 2);
        write_sign_residual(grad_in, memory_out, &vec![1.0; grad_in.len()]);
        Ok(bits)
    }
}

/// Signs scaled by each tensor's mean absolute value.
///
/// Every worker also sends one L1 norm per tensor. The output for tensor
/// `t` is `Σ_w norm_w / nelement / n · sign_w`.
#[derive(Debug)]
pub struct SignAndNormReducer {
    pub(super) ctx: ReducerContext,
    codec: SignCompressor,
}

impl SignAndNormReducer {
    pub fn new(ctx: ReducerContext) -> Result<Self> {
        Ok(Self {
            ctx,
            codec: SignCompressor::new()?,
        })
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
        let len = flat.nelement();
        let my_norms: Vec<f32> = grad_in.iter().map(Tensor::l1_norm).collect();
        let words = {
            let _t = self.ctx.timer().begin("reduce.compress", 2);
            self.codec.compress_slice(flat.buffer())
        };
        let bits = n_bits(&words) + n_bits(&my_norms);

        let (signs, norms) = {
            let _t = self.ctx.timer().begin("reduce.gather", 2);
            let comm = self.ctx.comm();
            tokio::try_join!(comm.all_gather(&words), comm.all_gather(&my_norms))?
        };

        {
            let _t = self.ctx.timer().begin("reduce.average", 2);
            let n = self.ctx.n_workers() as f32;
            let mut acc = vec![0.0f32; len];
            for (their_words, their_norms) in signs.iter().zip(&norms) {
                flat.set_buffer(self.codec.uncompress_slice(their_words, len)?)?;
                let mut offset = 0;
                for (i, &norm) in their_norms.iter().enumerate() {
                    let segment = flat.get(i);
                    let scale = norm / segment.len().max(1) as f32 / n;
                    for (a, &s) in acc[offset..offset + segment.len()].iter_mut().zip(segment) {
                        *a += scale * s;
                    }
                    offset += segment.len();
                }
            }
            flat.set_buffer(acc)?;
            flat.unpack(grad_out.iter_mut())?;
        }

        let _t = self.ctx.timer().begin("reduce.memory", 2);
        let scales: Vec<f32> = grad_in
            .iter()
            .zip(&my_norms)
            .map(|(t, &norm)| norm / t.nelement().max(1) as f32)
            .collect();
        write_sign_residual(grad_in, memory_out, &scales);
        Ok(bits)
    }
}

/// Per-coordinate majority vote of the workers' signs. Ties give `+1`.
#[derive(Debug)]
pub struct MajorityVoteReducer {
    pub(super) ctx: ReducerContext,
    codec: SignCompressor,
}

impl MajorityVoteReducer {
    pub fn new(ctx: ReducerContext) -> Result<Self> {
        Ok(Self {
            ctx,
            codec: SignCompressor::new()?,
        })
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
        let len = flat.nelement();
        let (gathered, bits) = gather_signs(&self.ctx, &self.codec, &flat).await?;

        {
            let _t = self.ctx.timer().begin("reduce.majorityvote", 2);
            let voted = self.codec.majority_vote(&gathered, len)?;
            flat.set_buffer(self.codec.uncompress_slice(&voted, len)?)?;
            flat.unpack(grad_out.iter_mut())?;
        }

        let _t = self.ctx.timer().begin("reduce.memory", 2);
        write_sign_residual(grad_in, memory_out, &vec![1.0; grad_in.len()]);
        Ok(bits)
    }
}
