use crate::error::Result;
use crate::types::Rank;
use futures::future::BoxFuture;

/// Identifies one point-to-point message inside a collective.
///
/// `tag` names the collective call and `step` the round within it, so two
/// collectives in flight between the same pair of workers never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub src: Rank,
    pub dest: Rank,
    pub tag: u64,
    pub step: u32,
}

/// Point-to-point byte delivery between the workers of one group.
///
/// Collective algorithms are written against this trait. A send to a key
/// is matched by exactly one receive of the same key.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, key: MessageKey, payload: Vec<u8>) -> BoxFuture<'_, Result<()>>;

    fn recv(&self, key: MessageKey) -> BoxFuture<'_, Result<Vec<u8>>>;
}
