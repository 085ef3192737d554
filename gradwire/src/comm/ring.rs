//! Collective algorithms over a [`Transport`](super::Transport).

use super::Communicator;
use super::transport::MessageKey;
use crate::error::{GradwireError, Result};
use crate::reduce::sum_into;
use crate::types::{Element, Rank};
use futures::future::try_join_all;

/// Split `count` elements into `world` contiguous chunks. The first
/// `count % world` chunks hold one extra element.
pub(crate) struct ChunkLayout {
    offsets: Vec<usize>,
    counts: Vec<usize>,
}

impl ChunkLayout {
    pub(crate) fn new(count: usize, world: usize) -> Self {
        let base = count / world;
        let extra = count % world;
        let counts: Vec<usize> = (0..world).map(|i| base + usize::from(i < extra)).collect();
        let mut offsets = Vec::with_capacity(world);
        let mut off = 0;
        for &c in &counts {
            offsets.push(off);
            off += c;
        }
        Self { offsets, counts }
    }

    fn range(&self, idx: usize) -> std::ops::Range<usize> {
        self.offsets[idx]..self.offsets[idx] + self.counts[idx]
    }
}

fn encode<T: Element>(values: &[T]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

fn decode<T: Element>(bytes: &[u8], operation: &'static str, src: Rank) -> Result<Vec<T>> {
    let size = T::DTYPE.size_in_bytes();
    if bytes.len() % size != 0 {
        return Err(GradwireError::CollectiveFailed {
            operation,
            rank: src,
            reason: format!("{} bytes is not a whole number of {}", bytes.len(), T::DTYPE),
        });
    }
    let mut out = vec![<T as bytemuck::Zeroable>::zeroed(); bytes.len() / size];
    bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(bytes);
    Ok(out)
}

fn check_len(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(GradwireError::BufferSizeMismatch { expected, actual });
    }
    Ok(())
}

async fn send<T: Element>(
    comm: &Communicator,
    dest: Rank,
    tag: u64,
    step: u32,
    values: &[T],
) -> Result<()> {
    let key = MessageKey {
        src: comm.rank(),
        dest,
        tag,
        step,
    };
    comm.link()?.send(key, encode(values)).await
}

async fn recv<T: Element>(
    comm: &Communicator,
    src: Rank,
    tag: u64,
    step: u32,
    operation: &'static str,
) -> Result<Vec<T>> {
    let key = MessageKey {
        src,
        dest: comm.rank(),
        tag,
        step,
    };
    let bytes = comm.link()?.recv(key).await?;
    decode(&bytes, operation, src)
}

/// Send `outgoing` to the next rank while receiving from the previous one.
async fn ring_step<T: Element>(
    comm: &Communicator,
    tag: u64,
    step: u32,
    outgoing: &[T],
    operation: &'static str,
) -> Result<Vec<T>> {
    let world = comm.world_size();
    let rank = comm.rank();
    let next = (rank + 1) % world;
    let prev = (rank + world - 1) % world;
    let (_, received) = tokio::try_join!(
        send(comm, next, tag, step, outgoing),
        recv::<T>(comm, prev, tag, step, operation),
    )?;
    Ok(received)
}

/// Ring all-reduce (sum), in place.
///
/// 1. Scatter-reduce: N-1 rounds. Each rank sends one chunk to the next
///    rank and sums the chunk received from the previous rank.
/// 2. Allgather: N-1 rounds circulating the fully reduced chunks.
pub(crate) async fn ring_allreduce<T: Element>(
    comm: &Communicator,
    tag: u64,
    data: &mut [T],
) -> Result<()> {
    let world = comm.world_size() as usize;
    if world <= 1 {
        return Ok(());
    }
    let rank = comm.rank() as usize;
    let layout = ChunkLayout::new(data.len(), world);

    for step in 0..world - 1 {
        let send_idx = (rank + world - step) % world;
        let recv_idx = (rank + world - step - 1) % world;
        let outgoing = data[layout.range(send_idx)].to_vec();
        let received = ring_step(comm, tag, step as u32, &outgoing, "allreduce").await?;
        let dst = &mut data[layout.range(recv_idx)];
        check_len(dst.len(), received.len())?;
        sum_into(dst, &received)?;
    }

    for step in 0..world - 1 {
        let send_idx = (rank + world + 1 - step) % world;
        let recv_idx = (rank + world - step) % world;
        let outgoing = data[layout.range(send_idx)].to_vec();
        let round = (world - 1 + step) as u32;
        let received = ring_step(comm, tag, round, &outgoing, "allreduce").await?;
        let dst = &mut data[layout.range(recv_idx)];
        check_len(dst.len(), received.len())?;
        dst.copy_from_slice(&received);
    }
    Ok(())
}

/// Ring allgather: slot `i` of the result is rank `i`'s contribution.
///
/// Every rank must contribute the same number of elements.
pub(crate) async fn ring_allgather<T: Element>(
    comm: &Communicator,
    tag: u64,
    data: &[T],
) -> Result<Vec<Vec<T>>> {
    let world = comm.world_size() as usize;
    let rank = comm.rank() as usize;
    let mut slots: Vec<Vec<T>> = vec![Vec::new(); world];
    slots[rank] = data.to_vec();

    for step in 0..world.saturating_sub(1) {
        let send_idx = (rank + world - step) % world;
        let recv_idx = (rank + world - step - 1) % world;
        let received = ring_step(comm, tag, step as u32, &slots[send_idx], "allgather").await?;
        check_len(data.len(), received.len())?;
        slots[recv_idx] = received;
    }
    Ok(slots)
}

/// Flat gather: root posts N-1 concurrent receives. Contributions may
/// differ in length.
pub(crate) async fn flat_gather<T: Element>(
    comm: &Communicator,
    tag: u64,
    data: &[T],
    root: Rank,
) -> Result<Option<Vec<Vec<T>>>> {
    let world = comm.world_size();
    let rank = comm.rank();
    if rank != root {
        send(comm, root, tag, 0, data).await?;
        return Ok(None);
    }

    let futs: Vec<_> = (0..world)
        .filter(|&r| r != root)
        .map(|r| async move { Ok::<_, GradwireError>((r, recv::<T>(comm, r, tag, 0, "gather").await?)) })
        .collect();
    let mut slots: Vec<Vec<T>> = vec![Vec::new(); world as usize];
    slots[root as usize] = data.to_vec();
    for (r, received) in try_join_all(futs).await? {
        slots[r as usize] = received;
    }
    Ok(Some(slots))
}

/// Binary-tree broadcast rooted at `root`. Non-root buffers are replaced
/// by the root's, whatever their prior length.
pub(crate) async fn tree_broadcast<T: Element>(
    comm: &Communicator,
    tag: u64,
    data: &mut Vec<T>,
    root: Rank,
) -> Result<()> {
    let world = comm.world_size();
    if world <= 1 {
        return Ok(());
    }
    let rank = comm.rank();

    // Remap ranks so root becomes logical rank 0.
    let logical = |r: Rank| -> Rank { (r + world - root) % world };
    let physical = |l: Rank| -> Rank { (l + root) % world };
    let my_logical = logical(rank);

    if my_logical != 0 {
        let parent = physical((my_logical - 1) / 2);
        *data = recv(comm, parent, tag, 0, "broadcast").await?;
    }

    let payload: &[T] = data;
    let futs: Vec<_> = [2 * my_logical + 1, 2 * my_logical + 2]
        .into_iter()
        .filter(|&child| child < world)
        .map(|child| send(comm, physical(child), tag, 0, payload))
        .collect();
    if !futs.is_empty() {
        try_join_all(futs).await?;
    }
    Ok(())
}
