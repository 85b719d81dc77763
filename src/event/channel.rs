use std::sync::Arc;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use super::{
    error::Error,
    wire::{ChannelId, RequestEvent},
};

/// One live remote peer connection.
///
/// The registry owns channels for their whole lifetime. Everybody else only
/// holds a reference long enough to push a request.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    origin: Option<String>,
    seq: u64,
    connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<RequestEvent>,
    closed: CancellationToken,
}

impl Channel {
    pub(crate) fn new(
        seq: u64,
        origin: Option<String>,
        outbound: mpsc::Sender<RequestEvent>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            id: ChannelId::random(),
            origin,
            seq,
            connected_at: Utc::now(),
            outbound,
            closed,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Best-effort label of the peer, e.g. its network address.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Position of this channel in connection order.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled once the channel is torn down.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    /// Queues an event for the peer without waiting. A full queue is an
    /// error: a silently dropped request would look exactly like a dead
    /// peer.
    pub fn push(&self, event: RequestEvent) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ChannelClosed(self.id));
        }
        self.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull(self.id),
            mpsc::error::TrySendError::Closed(_) => Error::ChannelClosed(self.id),
        })
    }

    /// Resolves when the peer drops its end of the outbound queue.
    pub(crate) async fn peer_gone(&self) {
        self.outbound.closed().await
    }
}

/// Table of the channels that are currently reachable.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, channel: Arc<Channel>) {
        self.channels.write().await.insert(channel.id(), channel);
    }

    /// Removing an absent channel is a no-op.
    pub async fn remove(&self, id: &ChannelId) -> Option<Arc<Channel>> {
        self.channels.write().await.remove(id)
    }

    pub async fn get(&self, id: &ChannelId) -> Option<Arc<Channel>> {
        self.channels.read().await.get(id).cloned()
    }

    /// Point-in-time snapshot of the live channels in connection order.
    /// Channels may close right after the snapshot is taken; pushing to them
    /// then fails with `ChannelClosed`.
    pub async fn list(&self) -> Vec<Arc<Channel>> {
        let mut channels: Vec<_> = self
            .channels
            .read()
            .await
            .values()
            .filter(|channel| !channel.is_closed())
            .cloned()
            .collect();
        channels.sort_unstable_by_key(|channel| channel.seq());
        channels
    }

    /// Counts the same channels `list` would return.
    pub async fn len(&self) -> usize {
        self.channels
            .read()
            .await
            .values()
            .filter(|channel| !channel.is_closed())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::wire::Method;

    fn channel(seq: u64, capacity: usize) -> (Arc<Channel>, mpsc::Receiver<RequestEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let channel = Channel::new(seq, None, tx, CancellationToken::new());
        (Arc::new(channel), rx)
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_connection() {
        let registry = ChannelRegistry::new();
        let (a, _rx_a) = channel(2, 1);
        let (b, _rx_b) = channel(1, 1);
        registry.add(a.clone()).await;
        registry.add(b.clone()).await;

        let ids: Vec<_> = registry.list().await.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![b.id(), a.id()]);
    }

    #[tokio::test]
    async fn test_remove_twice_is_noop() {
        let registry = ChannelRegistry::new();
        let (a, _rx) = channel(0, 1);
        registry.add(a.clone()).await;

        assert!(registry.remove(&a.id()).await.is_some());
        assert!(registry.remove(&a.id()).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_skips_closed_channels() {
        let registry = ChannelRegistry::new();
        let (a, _rx) = channel(0, 1);
        registry.add(a.clone()).await;
        a.close();

        assert!(registry.list().await.is_empty());
        assert_eq!(registry.len().await, 0);
        assert!(registry.is_empty().await);
        assert!(registry.get(&a.id()).await.is_some());
    }

    #[tokio::test]
    async fn test_push_to_full_queue_fails() {
        let (a, _rx) = channel(0, 1);
        a.push(RequestEvent::new(Method::HasResource, vec![])).unwrap();

        let err = a
            .push(RequestEvent::new(Method::HasResource, vec![]))
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull(id) if id == a.id()));
    }

    #[tokio::test]
    async fn test_push_after_close_fails() {
        let (a, _rx) = channel(0, 4);
        a.close();

        let err = a
            .push(RequestEvent::new(Method::GetResource, vec![]))
            .unwrap_err();
        assert!(matches!(err, Error::ChannelClosed(_)));
    }
}
