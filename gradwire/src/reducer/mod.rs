//! Gradient reducers.
//!
//! A [`Reducer`] turns one worker's gradients into an estimate of the mean
//! gradient across all workers, writing the part it could not send into
//! the caller's error-feedback memory:
//!
//! ```text
//! bits = reducer.reduce(&grad_in, &mut grad_out, &mut memory_out).await?;
//! ```
//!
//! Every worker must build its reducer with the same seed and call
//! `reduce` with gradients of the same shapes in the same order. Random
//! projections and masks are then drawn identically everywhere without
//! communication.

mod embedding;
mod exact;
mod half_rank_k;
mod random_sparse;
mod rank_k;
mod sign_sgd;
mod sketch;
mod svd;
mod topk;

pub use embedding::{EmbedExchange, SparseEmbedReducer};
pub use exact::ExactReducer;
pub use half_rank_k::HalfRankKReducer;
pub use random_sparse::{RandomSparseReducer, SparseSize};
pub use rank_k::{RankKReducer, RankSpec};
pub use sign_sgd::{MajorityVoteReducer, SignAndNormReducer, SignReducer};
pub use sketch::SketchEmbedReducer;
pub use svd::{AtomoReducer, SvdReducer};
pub use topk::{GlobalTopKReducer, TopKReducer};

use crate::buffer::{PendingBuffer, TensorBuffer};
use crate::comm::Communicator;
use crate::config::ReducerConfig;
use crate::error::{GradwireError, Result};
use crate::tensor::{Tensor, check_aligned};
use crate::timer::Timer;
use crate::types::Rank;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::fmt;
use std::str::FromStr;

/// Every reducer strategy, by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReducerKind {
    Exact,
    Sign,
    SignAndNorm,
    MajorityVote,
    TopK,
    GlobalTopK,
    UniformRandomSparse,
    UniformRandomSparseBlock,
    RandomSparse,
    RandomSparseBlock,
    Svd,
    Atomo,
    RankK,
    MultiRankK,
    RankKSparse,
    HalfRankK,
    SketchEmbed,
    OmniEmbed,
    ExactEmbed,
    SparCml,
    Parallax,
}

impl ReducerKind {
    pub const ALL: [ReducerKind; 21] = [
        ReducerKind::Exact,
        ReducerKind::Sign,
        ReducerKind::SignAndNorm,
        ReducerKind::MajorityVote,
        ReducerKind::TopK,
        ReducerKind::GlobalTopK,
        ReducerKind::UniformRandomSparse,
        ReducerKind::UniformRandomSparseBlock,
        ReducerKind::RandomSparse,
        ReducerKind::RandomSparseBlock,
        ReducerKind::Svd,
        ReducerKind::Atomo,
        ReducerKind::RankK,
        ReducerKind::MultiRankK,
        ReducerKind::RankKSparse,
        ReducerKind::HalfRankK,
        ReducerKind::SketchEmbed,
        ReducerKind::OmniEmbed,
        ReducerKind::ExactEmbed,
        ReducerKind::SparCml,
        ReducerKind::Parallax,
    ];

    /// Canonical snake_case name.
    pub const fn name(self) -> &'static str {
        match self {
            ReducerKind::Exact => "exact",
            ReducerKind::Sign => "sign",
            ReducerKind::SignAndNorm => "sign_and_norm",
            ReducerKind::MajorityVote => "majority_vote",
            ReducerKind::TopK => "top_k",
            ReducerKind::GlobalTopK => "global_top_k",
            ReducerKind::UniformRandomSparse => "uniform_random_sparse",
            ReducerKind::UniformRandomSparseBlock => "uniform_random_sparse_block",
            ReducerKind::RandomSparse => "random_sparse",
            ReducerKind::RandomSparseBlock => "random_sparse_block",
            ReducerKind::Svd => "svd",
            ReducerKind::Atomo => "atomo",
            ReducerKind::RankK => "rank_k",
            ReducerKind::MultiRankK => "multi_rank_k",
            ReducerKind::RankKSparse => "rank_k_sparse",
            ReducerKind::HalfRankK => "half_rank_k",
            ReducerKind::SketchEmbed => "sketch_embed",
            ReducerKind::OmniEmbed => "omni_embed",
            ReducerKind::ExactEmbed => "exact_embed",
            ReducerKind::SparCml => "sparcml",
            ReducerKind::Parallax => "parallax",
        }
    }
}

impl fmt::Display for ReducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReducerKind {
    type Err = GradwireError;

    /// Accepts the canonical name, case-insensitively, with `-` for `_`.
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ReducerKind::ALL
            .into_iter()
            .find(|k| k.name() == normalized)
            .ok_or_else(|| GradwireError::UnknownReducer(s.to_string()))
    }
}

/// Which gradient tensors a reducer compresses. The rest take the exact
/// passthrough path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Tensors with more than one dimension.
    Matrices,
    /// Tensors whose name contains the pattern. Unnamed tensors never match.
    NameContains(String),
    /// One flag per gradient, in gradient order.
    Mask(Vec<bool>),
}

impl Selection {
    /// Embedding parameters, selected by name.
    pub fn embeddings() -> Self {
        Selection::NameContains("embed".into())
    }

    /// One flag per tensor: `true` where the tensor is compressed.
    pub fn classify(&self, tensors: &[Tensor]) -> Result<Vec<bool>> {
        match self {
            Selection::Matrices => Ok(tensors.iter().map(|t| t.ndim() > 1).collect()),
            Selection::NameContains(pattern) => Ok(tensors
                .iter()
                .map(|t| t.name().is_some_and(|n| n.contains(pattern.as_str())))
                .collect()),
            Selection::Mask(mask) => {
                if mask.len() != tensors.len() {
                    return Err(GradwireError::count_mismatch(tensors.len(), mask.len()));
                }
                Ok(mask.clone())
            }
        }
    }
}

/// State shared by every strategy: the seeded RNG, the communicator and
/// the timer.
#[derive(Debug)]
pub struct ReducerContext {
    seed: u64,
    rng: StdRng,
    comm: Communicator,
    timer: Timer,
}

impl ReducerContext {
    pub fn new(seed: u64, comm: Communicator, timer: Timer) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
            comm,
            timer,
        }
    }

    /// Single-worker context with timing disabled.
    pub fn solo(seed: u64) -> Self {
        Self::new(seed, Communicator::solo(), Timer::disabled())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn n_workers(&self) -> usize {
        self.comm.n_workers()
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub(crate) fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Fill `out` with standard normal samples from a sub-seed drawn off
    /// the shared RNG.
    pub(crate) fn fill_normal(&mut self, out: &mut [f32]) {
        let sub_seed = self.rng.gen_range(0..1_000_000_000u64);
        let mut local = StdRng::seed_from_u64(sub_seed);
        for v in out {
            *v = local.sample(StandardNormal);
        }
    }

    /// `k` distinct indices in `0..n`.
    pub(crate) fn sample_indices(&mut self, n: usize, k: usize) -> Vec<usize> {
        rand::seq::index::sample(&mut self.rng, n, k.min(n)).into_vec()
    }
}

/// A gradient-compression strategy.
#[derive(Debug)]
pub enum Reducer {
    Exact(ExactReducer),
    Sign(SignReducer),
    SignAndNorm(SignAndNormReducer),
    MajorityVote(MajorityVoteReducer),
    TopK(TopKReducer),
    GlobalTopK(GlobalTopKReducer),
    RandomSparse(RandomSparseReducer),
    Svd(SvdReducer),
    Atomo(AtomoReducer),
    RankK(RankKReducer),
    HalfRankK(HalfRankKReducer),
    SketchEmbed(SketchEmbedReducer),
    SparseEmbed(SparseEmbedReducer),
}

impl Reducer {
    /// Build the reducer described by `config` on top of `comm`.
    pub fn from_config(config: &ReducerConfig, comm: Communicator) -> Result<Self> {
        let ctx = ReducerContext::new(config.seed, comm, Timer::new(config.timer_verbosity));
        Self::build(config, ctx)
    }

    /// Build the reducer described by `config` with an existing context.
    pub fn build(config: &ReducerConfig, ctx: ReducerContext) -> Result<Self> {
        config.validate()?;
        let selection = config.selection.clone();
        let reducer = match config.kind {
            ReducerKind::Exact => Reducer::Exact(ExactReducer::new(ctx)),
            ReducerKind::Sign => Reducer::Sign(SignReducer::new(ctx)?),
            ReducerKind::SignAndNorm => Reducer::SignAndNorm(SignAndNormReducer::new(ctx)?),
            ReducerKind::MajorityVote => Reducer::MajorityVote(MajorityVoteReducer::new(ctx)?),
            ReducerKind::TopK => Reducer::TopK(TopKReducer::new(ctx, config.compression)?),
            ReducerKind::GlobalTopK => {
                Reducer::GlobalTopK(GlobalTopKReducer::new(ctx, config.compression)?)
            }
            ReducerKind::UniformRandomSparse => Reducer::RandomSparse(RandomSparseReducer::new(
                ctx,
                SparseSize::Fraction(config.compression),
                false,
            )?),
            ReducerKind::UniformRandomSparseBlock => {
                Reducer::RandomSparse(RandomSparseReducer::new(
                    ctx,
                    SparseSize::Fraction(config.compression),
                    true,
                )?)
            }
            ReducerKind::RandomSparse => Reducer::RandomSparse(RandomSparseReducer::new(
                ctx,
                SparseSize::RankProportional(config.rank),
                false,
            )?),
            ReducerKind::RandomSparseBlock => Reducer::RandomSparse(RandomSparseReducer::new(
                ctx,
                SparseSize::RankProportional(config.rank),
                true,
            )?),
            ReducerKind::Svd => Reducer::Svd(SvdReducer::new(ctx, config.rank, selection)?),
            ReducerKind::Atomo => Reducer::Atomo(AtomoReducer::new(ctx, config.rank)?),
            ReducerKind::RankK => Reducer::RankK(RankKReducer::new(
                ctx,
                RankSpec::Uniform(config.rank),
                config.reuse_query,
                selection,
            )?),
            ReducerKind::MultiRankK => {
                let ranks = config.ranks.clone().ok_or_else(|| {
                    GradwireError::config("multi_rank_k needs a per-tensor rank list")
                })?;
                Reducer::RankK(RankKReducer::new(
                    ctx,
                    RankSpec::PerTensor(ranks),
                    config.reuse_query,
                    selection,
                )?)
            }
            ReducerKind::RankKSparse => Reducer::RankK(RankKReducer::sparse(
                ctx,
                config.rank,
                config.reuse_query,
                config.sparsity,
                selection,
            )?),
            ReducerKind::HalfRankK => {
                Reducer::HalfRankK(HalfRankKReducer::new(ctx, config.rank, selection)?)
            }
            ReducerKind::SketchEmbed => Reducer::SketchEmbed(SketchEmbedReducer::new(
                ctx,
                config.rank,
                config.sparsity,
                config.sketch_rows,
                selection,
            )?),
            ReducerKind::OmniEmbed => Reducer::SparseEmbed(SparseEmbedReducer::new(
                ctx,
                EmbedExchange::RowBitmap,
                selection,
            )),
            ReducerKind::ExactEmbed => Reducer::SparseEmbed(SparseEmbedReducer::new(
                ctx,
                EmbedExchange::Coordinates,
                selection,
            )),
            ReducerKind::SparCml => Reducer::SparseEmbed(SparseEmbedReducer::new(
                ctx,
                EmbedExchange::Adaptive,
                selection,
            )),
            ReducerKind::Parallax => Reducer::SparseEmbed(SparseEmbedReducer::new(
                ctx,
                EmbedExchange::GatherBroadcast,
                selection,
            )),
        };
        tracing::debug!(
            reducer = reducer.name(),
            seed = config.seed,
            rank = reducer.context().rank(),
            n_workers = reducer.context().n_workers(),
            "reducer built"
        );
        Ok(reducer)
    }

    pub fn kind(&self) -> ReducerKind {
        match self {
            Reducer::Exact(_) => ReducerKind::Exact,
            Reducer::Sign(_) => ReducerKind::Sign,
            Reducer::SignAndNorm(_) => ReducerKind::SignAndNorm,
            Reducer::MajorityVote(_) => ReducerKind::MajorityVote,
            Reducer::TopK(_) => ReducerKind::TopK,
            Reducer::GlobalTopK(_) => ReducerKind::GlobalTopK,
            Reducer::RandomSparse(r) => r.kind(),
            Reducer::Svd(_) => ReducerKind::Svd,
            Reducer::Atomo(_) => ReducerKind::Atomo,
            Reducer::RankK(r) => r.kind(),
            Reducer::HalfRankK(_) => ReducerKind::HalfRankK,
            Reducer::SketchEmbed(_) => ReducerKind::SketchEmbed,
            Reducer::SparseEmbed(r) => r.kind(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn context(&self) -> &ReducerContext {
        match self {
            Reducer::Exact(r) => &r.ctx,
            Reducer::Sign(r) => &r.ctx,
            Reducer::SignAndNorm(r) => &r.ctx,
            Reducer::MajorityVote(r) => &r.ctx,
            Reducer::TopK(r) => &r.ctx,
            Reducer::GlobalTopK(r) => &r.ctx,
            Reducer::RandomSparse(r) => &r.ctx,
            Reducer::Svd(r) => &r.ctx,
            Reducer::Atomo(r) => &r.ctx,
            Reducer::RankK(r) => &r.ctx,
            Reducer::HalfRankK(r) => &r.ctx,
            Reducer::SketchEmbed(r) => &r.ctx,
            Reducer::SparseEmbed(r) => &r.ctx,
        }
    }

    pub fn n_workers(&self) -> usize {
        self.context().n_workers()
    }

    pub fn rank(&self) -> Rank {
        self.context().rank()
    }

    pub fn timer(&self) -> &Timer {
        self.context().timer()
    }

    /// Reduce one step of gradients.
    ///
    /// Writes the estimate of the cross-worker mean into `grad_out` and the
    /// residual into `memory_out`. Returns the number of bits this worker
    /// placed on the wire.
    pub async fn reduce(
        &mut self,
        grad_in: &[Tensor],
        grad_out: &mut [Tensor],
        memory_out: &mut [Tensor],
    ) -> Result<u64> {
        check_aligned(grad_in, grad_out, memory_out)?;
        match self {
            Reducer::Exact(r) => r.reduce(grad_in, grad_out, memory_out).await,
            Reducer::Sign(r) => r.reduce(grad_in, grad_out, memory_out).await,
            Reducer::SignAndNorm(r) => r.reduce(grad_in, grad_out, memory_out).await,
            Reducer::MajorityVote(r) => r.reduce(grad_in, grad_out, memory_out).await,
            Reducer::TopK(r) => r.reduce(grad_in, grad_out, memory_out).await,
            Reducer::GlobalTopK(r) => r.reduce(grad_in, grad_out, memory_out).await,
            Reducer::RandomSparse(r) => r.reduce(grad_in, grad_out, memory_out).await,
            Reducer::Svd(r) => r.reduce(grad_in, grad_out, memory_out).await,
            Reducer::Atomo(r) => r.reduce(grad_in, grad_out, memory_out).await,
            Reducer::RankK(r) => r.reduce(grad_in, grad_out, memory_out).await,
            Reducer::HalfRankK(r) => r.reduce(grad_in, grad_out, memory_out).await,
            Reducer::SketchEmbed(r) => r.reduce(grad_in, grad_out, memory_out).await,
            Reducer::SparseEmbed(r) => r.reduce(grad_in, grad_out, memory_out).await,
        }
    }
}

macro_rules! impl_from_reducer {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for Reducer {
                fn from(r: $ty) -> Self {
                    Reducer::$variant(r)
                }
            }
        )*
    };
}

impl_from_reducer!(
    Exact(ExactReducer),
    Sign(SignReducer),
    SignAndNorm(SignAndNormReducer),
    MajorityVote(MajorityVoteReducer),
    TopK(TopKReducer),
    GlobalTopK(GlobalTopKReducer),
    RandomSparse(RandomSparseReducer),
    Svd(SvdReducer),
    Atomo(AtomoReducer),
    RankK(RankKReducer),
    HalfRankK(HalfRankKReducer),
    SketchEmbed(SketchEmbedReducer),
    SparseEmbed(SparseEmbedReducer),
);

/// Exact mean of `tensors` written into `outs`: pack, all-reduce, divide
/// by the worker count, unpack. Returns the bits sent.
pub(crate) async fn reduce_mean_list<'a>(
    ctx: &ReducerContext,
    tensors: impl IntoIterator<Item = &'a Tensor>,
    outs: impl IntoIterator<Item = &'a mut Tensor>,
) -> Result<u64> {
    let mut buffer = {
        let _t = ctx.timer.begin("reduce.mean.pack", 2);
        TensorBuffer::new(tensors)
    };
    {
        let _t = ctx.timer.begin("reduce.mean.all_reduce", 2);
        buffer.all_reduce(&ctx.comm).await?;
    }
    buffer.scale(1.0 / ctx.n_workers() as f32);
    buffer.unpack(outs)?;
    Ok(buffer.bits())
}

/// Exact reduction of the tensors a strategy does not compress, run as a
/// non-blocking all-reduce alongside the compressed path.
pub(crate) struct Passthrough {
    pending: PendingBuffer,
    bits: u64,
}

impl Passthrough {
    pub(crate) fn start<'a>(
        ctx: &ReducerContext,
        tensors: impl IntoIterator<Item = &'a Tensor>,
    ) -> Self {
        let buffer = {
            let _t = ctx.timer.begin("reduce.rank1.pack", 1);
            TensorBuffer::new(tensors)
        };
        let bits = buffer.bits();
        Self {
            pending: buffer.all_reduce_nb(&ctx.comm),
            bits,
        }
    }

    pub(crate) fn bits(&self) -> u64 {
        self.bits
    }

    /// Wait for the all-reduce and write the means into `outs`.
    pub(crate) async fn finish<'a>(
        self,
        ctx: &ReducerContext,
        outs: impl IntoIterator<Item = &'a mut Tensor>,
    ) -> Result<()> {
        let _t = ctx.timer.begin("reduce.rank1.unpack", 1);
        let mut buffer = self.pending.wait().await?;
        buffer.scale(1.0 / ctx.n_workers() as f32);
        buffer.unpack(outs)
    }
}

/// Items of `items` whose flag equals `wanted`.
pub(crate) fn pick<'a, T>(
    items: &'a [T],
    mask: &'a [bool],
    wanted: bool,
) -> impl Iterator<Item = &'a T> + 'a {
    items
        .iter()
        .zip(mask)
        .filter(move |(_, m)| **m == wanted)
        .map(|(t, _)| t)
}

/// Mutable items of `items` whose flag equals `wanted`.
pub(crate) fn pick_mut<'a, T>(
    items: &'a mut [T],
    mask: &'a [bool],
    wanted: bool,
) -> impl Iterator<Item = &'a mut T> + 'a {
    items
        .iter_mut()
        .zip(mask)
        .filter(move |(_, m)| **m == wanted)
        .map(|(t, _)| t)
}

/// Zero the memory of every tensor with flag `wanted`.
pub(crate) fn zero_memory(memory_out: &mut [Tensor], mask: &[bool], wanted: bool) {
    for m in pick_mut(memory_out, mask, wanted) {
        m.fill(0.0);
    }
}
