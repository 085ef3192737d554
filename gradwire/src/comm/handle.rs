use crate::error::{GradwireError, Result};
use crate::types::Rank;
use std::future::Future;
use tokio::task::JoinHandle;

enum State<T> {
    Ready(Result<T>),
    Running(JoinHandle<Result<T>>),
}

/// A handle to a non-blocking collective operation.
///
/// The collective runs in a spawned task. Call `wait()` once to get its
/// output, or check `is_finished()` to poll.
///
/// If dropped without calling `wait()`, the background task is aborted.
pub struct CollectiveHandle<T> {
    rank: Rank,
    state: Option<State<T>>,
}

impl<T: Send + 'static> CollectiveHandle<T> {
    /// Spawn a future as a non-blocking collective and return a handle.
    pub(crate) fn spawn(rank: Rank, fut: impl Future<Output = Result<T>> + Send + 'static) -> Self {
        Self {
            rank,
            state: Some(State::Running(tokio::spawn(fut))),
        }
    }

    /// A handle that is already complete.
    pub(crate) fn ready(rank: Rank, value: T) -> Self {
        Self {
            rank,
            state: Some(State::Ready(Ok(value))),
        }
    }

    /// Wait for the collective to complete and propagate any error.
    pub async fn wait(mut self) -> Result<T> {
        match self.state.take() {
            Some(State::Ready(result)) => result,
            Some(State::Running(handle)) => handle.await.map_err(|e| GradwireError::CollectiveFailed {
                operation: "all_reduce_nb",
                rank: self.rank,
                reason: format!("collective task panicked: {e}"),
            })?,
            None => Err(GradwireError::CollectiveFailed {
                operation: "all_reduce_nb",
                rank: self.rank,
                reason: "handle already consumed".into(),
            }),
        }
    }

    /// Check if the collective has finished (non-blocking).
    pub fn is_finished(&self) -> bool {
        match &self.state {
            Some(State::Running(handle)) => handle.is_finished(),
            _ => true,
        }
    }
}

impl<T> Drop for CollectiveHandle<T> {
    fn drop(&mut self) {
        if let Some(State::Running(handle)) = &self.state {
            handle.abort();
        }
    }
}

/// A group of non-blocking collectives that can be waited on together.
pub struct CollectiveGroup<T> {
    handles: Vec<CollectiveHandle<T>>,
}

impl<T: Send + 'static> CollectiveGroup<T> {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    pub fn push(&mut self, h: CollectiveHandle<T>) {
        self.handles.push(h);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for all collectives in the group, in push order.
    ///
    /// Returns the first error encountered, if any. All tasks are awaited
    /// regardless of errors.
    pub async fn wait_all(self) -> Result<Vec<T>> {
        let mut outputs = Vec::with_capacity(self.handles.len());
        let mut first_err = None;
        for h in self.handles {
            match h.wait().await {
                Ok(v) => outputs.push(v),
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(outputs),
        }
    }
}

impl<T: Send + 'static> Default for CollectiveGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_handle() {
        let h = CollectiveHandle::ready(0, vec![1.0f32, 2.0]);
        assert!(h.is_finished());
        assert_eq!(h.wait().await.unwrap(), vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_spawned_handle() {
        let h = CollectiveHandle::spawn(1, async { Ok(7u32) });
        assert_eq!(h.wait().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_group_keeps_order_and_reports_error() {
        let mut group = CollectiveGroup::new();
        group.push(CollectiveHandle::ready(0, 1u32));
        group.push(CollectiveHandle::spawn(0, async { Ok(2u32) }));
        assert_eq!(group.len(), 2);
        assert_eq!(group.wait_all().await.unwrap(), vec![1, 2]);

        let mut group = CollectiveGroup::new();
        group.push(CollectiveHandle::spawn(0, async {
            Err::<u32, _>(GradwireError::config("boom"))
        }));
        group.push(CollectiveHandle::ready(0, 3u32));
        assert!(group.wait_all().await.is_err());
    }
}
