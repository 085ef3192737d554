use crate::comm::{Communicator, LocalMesh};
use crate::config::ReducerConfig;
use crate::error::{GradwireError, Result};
use crate::reducer::{Reducer, ReducerKind};
use crate::tensor::Tensor;
use crate::timer::Timer;
use crate::types::Rank;

/// Blocking wrapper around [`Reducer`] for synchronous training loops.
///
/// Owns a current-thread tokio runtime. Run one `SyncReducer` per OS
/// thread; the non-blocking passthrough is driven inside `reduce`.
pub struct SyncReducer {
    inner: Reducer,
    rt: tokio::runtime::Runtime,
}

fn runtime(rank: Rank) -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| GradwireError::CollectiveFailed {
            operation: "runtime",
            rank,
            reason: format!("tokio runtime: {e}"),
        })
}

impl SyncReducer {
    /// Wrap an existing reducer with a new runtime.
    pub fn new(inner: Reducer) -> Result<Self> {
        let rt = runtime(inner.rank())?;
        Ok(Self { inner, rt })
    }

    /// Build the reducer described by `config` on top of `comm`.
    pub fn from_config(config: &ReducerConfig, comm: Communicator) -> Result<Self> {
        Self::new(Reducer::from_config(config, comm)?)
    }

    /// One reducer per rank of an in-process mesh, all with the same config.
    pub fn bootstrap_local(config: &ReducerConfig, world_size: u32) -> Result<Vec<Self>> {
        LocalMesh::bootstrap(world_size)?
            .into_iter()
            .map(|comm| Self::from_config(config, comm))
            .collect()
    }

    pub fn rank(&self) -> Rank {
        self.inner.rank()
    }

    pub fn n_workers(&self) -> usize {
        self.inner.n_workers()
    }

    pub fn kind(&self) -> ReducerKind {
        self.inner.kind()
    }

    pub fn timer(&self) -> &Timer {
        self.inner.timer()
    }

    /// Access the underlying async reducer.
    pub fn inner(&self) -> &Reducer {
        &self.inner
    }

    /// Blocking [`Reducer::reduce`].
    pub fn reduce(
        &mut self,
        grad_in: &[Tensor],
        grad_out: &mut [Tensor],
        memory_out: &mut [Tensor],
    ) -> Result<u64> {
        self.rt
            .block_on(self.inner.reduce(grad_in, grad_out, memory_out))
    }
}
