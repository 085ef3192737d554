//! Reducer configuration.
//!
//! All values have defaults. Override via environment variables (prefixed
//! `GRADWIRE_`) or by constructing a custom `ReducerConfig`.

use crate::error::{GradwireError, Result};
use crate::reducer::{ReducerKind, Selection};

/// Default TopK / random-sparse compression ratio.
pub const DEFAULT_COMPRESSION: f64 = 1.0 / 244.0;

/// Default fraction of entries masked by RankKSparse and used by sketches.
pub const DEFAULT_SPARSITY: f64 = 0.1;

/// Construction parameters for a [`Reducer`](crate::Reducer).
#[derive(Debug, Clone, PartialEq)]
pub struct ReducerConfig {
    /// Which strategy to build.
    pub kind: ReducerKind,

    /// Shared RNG seed. Must be identical on every worker.
    pub seed: u64,

    /// Target rank for low-rank, SVD and rank-proportional reducers.
    pub rank: usize,

    /// Per-tensor ranks for Multi-RankK, aligned with the gradient order.
    pub ranks: Option<Vec<usize>>,

    /// Fraction of entries kept by TopK and uniform random sparsification.
    pub compression: f64,

    /// Mask fraction for RankKSparse, sketch width factor for SketchEmbed.
    pub sparsity: f64,

    /// Reuse the previous step's Q instead of drawing a fresh one.
    pub reuse_query: bool,

    /// Number of hash rows in a count sketch.
    pub sketch_rows: usize,

    /// Which tensors are compressed. `None` uses the reducer's default.
    pub selection: Option<Selection>,

    /// Timer level; scopes above it are inert.
    pub timer_verbosity: u8,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            kind: ReducerKind::Exact,
            seed: 0,
            rank: 1,
            ranks: None,
            compression: DEFAULT_COMPRESSION,
            sparsity: DEFAULT_SPARSITY,
            reuse_query: false,
            sketch_rows: 1,
            selection: None,
            timer_verbosity: 1,
        }
    }
}

impl ReducerConfig {
    pub fn new(kind: ReducerKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `GRADWIRE_REDUCER` (reducer name, e.g. `rank_k`)
    /// - `GRADWIRE_SEED`
    /// - `GRADWIRE_RANK`
    /// - `GRADWIRE_RANKS` (comma separated)
    /// - `GRADWIRE_COMPRESSION`
    /// - `GRADWIRE_SPARSITY`
    /// - `GRADWIRE_REUSE_QUERY` (`true`/`false`/`1`/`0`)
    /// - `GRADWIRE_SKETCH_ROWS`
    /// - `GRADWIRE_TIMER_VERBOSITY`
    /// - `GRADWIRE_EMBED_PATTERN` (selects tensors whose name contains it)
    ///
    /// A variable that is set but does not parse is an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = lookup("GRADWIRE_REDUCER") {
            cfg.kind = v.parse()?;
        }
        if let Some(v) = lookup("GRADWIRE_SEED") {
            cfg.seed = parse_var("GRADWIRE_SEED", &v)?;
        }
        if let Some(v) = lookup("GRADWIRE_RANK") {
            cfg.rank = parse_var("GRADWIRE_RANK", &v)?;
        }
        if let Some(v) = lookup("GRADWIRE_RANKS") {
            let ranks = v
                .split(',')
                .map(|r| parse_var("GRADWIRE_RANKS", r.trim()))
                .collect::<Result<Vec<usize>>>()?;
            cfg.ranks = Some(ranks);
        }
        if let Some(v) = lookup("GRADWIRE_COMPRESSION") {
            cfg.compression = parse_var("GRADWIRE_COMPRESSION", &v)?;
        }
        if let Some(v) = lookup("GRADWIRE_SPARSITY") {
            cfg.sparsity = parse_var("GRADWIRE_SPARSITY", &v)?;
        }
        if let Some(v) = lookup("GRADWIRE_REUSE_QUERY") {
            cfg.reuse_query = match v.as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                other => {
                    return Err(GradwireError::config(format!(
                        "GRADWIRE_REUSE_QUERY: expected a boolean, got {other:?}"
                    )));
                }
            };
        }
        if let Some(v) = lookup("GRADWIRE_SKETCH_ROWS") {
            cfg.sketch_rows = parse_var("GRADWIRE_SKETCH_ROWS", &v)?;
        }
        if let Some(v) = lookup("GRADWIRE_TIMER_VERBOSITY") {
            cfg.timer_verbosity = parse_var("GRADWIRE_TIMER_VERBOSITY", &v)?;
        }
        if let Some(v) = lookup("GRADWIRE_EMBED_PATTERN") {
            cfg.selection = Some(Selection::NameContains(v));
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject parameter values no reducer can work with.
    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(GradwireError::config("rank must be at least 1"));
        }
        if let Some(ranks) = &self.ranks {
            if ranks.contains(&0) {
                return Err(GradwireError::config("per-tensor ranks must be at least 1"));
            }
        }
        if !(self.compression > 0.0 && self.compression <= 1.0) {
            return Err(GradwireError::config(format!(
                "compression must be in (0, 1], got {}",
                self.compression
            )));
        }
        if !(0.0..=1.0).contains(&self.sparsity) {
            return Err(GradwireError::config(format!(
                "sparsity must be in [0, 1], got {}",
                self.sparsity
            )));
        }
        if self.kind == ReducerKind::SketchEmbed && self.sparsity == 0.0 {
            return Err(GradwireError::config("sketch_embed needs sparsity > 0"));
        }
        if self.sketch_rows == 0 {
            return Err(GradwireError::config("sketch_rows must be at least 1"));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| GradwireError::config(format!("{key}: cannot parse {value:?}: {e}")))
}
