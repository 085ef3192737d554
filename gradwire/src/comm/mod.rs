//! Collective communication between data-parallel workers.
//!
//! A [`Communicator`] is one worker's endpoint. Every collective takes the
//! next collective tag when it is *called*, not when it is first polled,
//! so collectives issued concurrently (e.g. under `tokio::try_join!`)
//! line up across workers as long as every worker issues them in the same
//! order.

mod handle;
mod local;
mod ring;
mod transport;

pub use handle::{CollectiveGroup, CollectiveHandle};
pub use local::LocalMesh;
pub use transport::{MessageKey, Transport};

use crate::error::{GradwireError, Result};
use crate::types::{Element, Rank};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// One worker's view of its collective group.
///
/// Clones share the transport and the tag counter.
#[derive(Clone)]
pub struct Communicator {
    rank: Rank,
    world_size: u32,
    transport: Option<Arc<dyn Transport>>,
    next_tag: Arc<AtomicU64>,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish_non_exhaustive()
    }
}

impl Communicator {
    /// A group of one. Collectives never touch a transport.
    pub fn solo() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            transport: None,
            next_tag: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Endpoint `rank` of a `world_size` group connected through `transport`.
    pub fn new(rank: Rank, world_size: u32, transport: Arc<dyn Transport>) -> Self {
        Self {
            rank,
            world_size,
            transport: Some(transport),
            next_tag: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// World size as a count of workers.
    pub fn n_workers(&self) -> usize {
        self.world_size as usize
    }

    fn take_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn link(&self) -> Result<&dyn Transport> {
        self.transport
            .as_deref()
            .ok_or_else(|| GradwireError::CollectiveFailed {
                operation: "transport",
                rank: self.rank,
                reason: "communicator has no transport".into(),
            })
    }

    fn check_root(&self, root: Rank) -> Result<()> {
        if root >= self.world_size {
            return Err(GradwireError::InvalidRoot {
                root,
                world_size: self.world_size,
            });
        }
        Ok(())
    }

    /// Sum `data` element-wise across all workers, in place.
    pub fn all_reduce<'a, T: Element>(
        &'a self,
        data: &'a mut [T],
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        let tag = self.take_tag();
        async move { ring::ring_allreduce(self, tag, data).await }
    }

    /// Non-blocking all-reduce (sum). The buffer is moved into a spawned
    /// task and handed back by [`CollectiveHandle::wait`].
    ///
    /// Must be called from within a tokio runtime when the world has more
    /// than one worker.
    pub fn all_reduce_nb<T: Element>(&self, mut data: Vec<T>) -> CollectiveHandle<Vec<T>> {
        if self.world_size <= 1 {
            return CollectiveHandle::ready(self.rank, data);
        }
        let tag = self.take_tag();
        let comm = self.clone();
        CollectiveHandle::spawn(self.rank, async move {
            ring::ring_allreduce(&comm, tag, &mut data).await?;
            Ok(data)
        })
    }

    /// Collect every worker's `data`; slot `i` holds rank `i`'s buffer.
    ///
    /// All workers must contribute the same number of elements.
    pub fn all_gather<'a, T: Element>(
        &'a self,
        data: &'a [T],
    ) -> impl Future<Output = Result<Vec<Vec<T>>>> + Send + 'a {
        let tag = self.take_tag();
        async move { ring::ring_allgather(self, tag, data).await }
    }

    /// Collect every worker's `data` at `root`. Returns `Some` on the root
    /// only. Contributions may differ in length.
    pub fn gather<'a, T: Element>(
        &'a self,
        data: &'a [T],
        root: Rank,
    ) -> impl Future<Output = Result<Option<Vec<Vec<T>>>>> + Send + 'a {
        let tag = self.take_tag();
        async move {
            self.check_root(root)?;
            if self.world_size <= 1 {
                return Ok(Some(vec![data.to_vec()]));
            }
            ring::flat_gather(self, tag, data, root).await
        }
    }

    /// Replace `data` on every worker with root's `data`.
    pub fn broadcast<'a, T: Element>(
        &'a self,
        data: &'a mut Vec<T>,
        root: Rank,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        let tag = self.take_tag();
        async move {
            self.check_root(root)?;
            ring::tree_broadcast(self, tag, data, root).await
        }
    }
}
