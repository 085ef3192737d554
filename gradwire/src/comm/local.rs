//! In-process transport: every worker is a task in the same process.

use super::Communicator;
use super::transport::{MessageKey, Transport};
use crate::error::{GradwireError, Result};
use crate::types::Rank;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// One rendezvous point per message key. Whichever side arrives first
/// creates the channel; the entry is removed once both halves are taken.
struct Slot {
    tx: Option<oneshot::Sender<Vec<u8>>>,
    rx: Option<oneshot::Receiver<Vec<u8>>>,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }

    fn is_drained(&self) -> bool {
        self.tx.is_none() && self.rx.is_none()
    }
}

#[derive(Default)]
struct Mailboxes {
    slots: Mutex<HashMap<MessageKey, Slot>>,
}

impl Mailboxes {
    fn take_sender(&self, key: MessageKey) -> Result<oneshot::Sender<Vec<u8>>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.entry(key).or_insert_with(Slot::new);
        let tx = slot.tx.take().ok_or_else(|| duplicate("send", key))?;
        if slot.is_drained() {
            slots.remove(&key);
        }
        Ok(tx)
    }

    fn take_receiver(&self, key: MessageKey) -> Result<oneshot::Receiver<Vec<u8>>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.entry(key).or_insert_with(Slot::new);
        let rx = slot.rx.take().ok_or_else(|| duplicate("recv", key))?;
        if slot.is_drained() {
            slots.remove(&key);
        }
        Ok(rx)
    }
}

fn duplicate(operation: &'static str, key: MessageKey) -> GradwireError {
    GradwireError::CollectiveFailed {
        operation,
        rank: key.src,
        reason: format!(
            "message tag {} step {} to rank {} used twice",
            key.tag, key.step, key.dest
        ),
    }
}

/// A full mesh of workers living in one process.
///
/// Messages are delivered through tokio oneshot channels keyed by
/// `(src, dest, tag, step)`.
pub struct LocalMesh {
    mailboxes: Arc<Mailboxes>,
}

impl LocalMesh {
    /// Create `world_size` connected communicators, indexed by rank.
    pub fn bootstrap(world_size: u32) -> Result<Vec<Communicator>> {
        if world_size == 0 {
            return Err(GradwireError::config("world size must be at least 1"));
        }
        let mesh: Arc<dyn Transport> = Arc::new(LocalMesh {
            mailboxes: Arc::new(Mailboxes::default()),
        });
        tracing::debug!(world_size, "local mesh bootstrapped");
        Ok((0..world_size)
            .map(|rank: Rank| Communicator::new(rank, world_size, Arc::clone(&mesh)))
            .collect())
    }
}

impl Transport for LocalMesh {
    fn send(&self, key: MessageKey, payload: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let tx = self.mailboxes.take_sender(key)?;
            tx.send(payload).map_err(|_| GradwireError::CollectiveFailed {
                operation: "send",
                rank: key.dest,
                reason: "receiver dropped".into(),
            })
        })
    }

    fn recv(&self, key: MessageKey) -> BoxFuture<'_, Result<Vec<u8>>> {
        Box::pin(async move {
            let rx = self.mailboxes.take_receiver(key)?;
            rx.await.map_err(|_| GradwireError::CollectiveFailed {
                operation: "recv",
                rank: key.src,
                reason: "sender dropped".into(),
            })
        })
    }
}
