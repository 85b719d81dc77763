use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures::{stream, Stream};
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, Instrument};

use crate::mount::Resourcer;

use super::{
    channel::{Channel, ChannelRegistry},
    config::{Config, SelectionPolicy},
    correlate::Correlator,
    error::Error,
    wire::{
        ChannelId, ConnectedCompleted, Method, RequestEvent, ResourceRequest,
        ResponseEvent,
    },
};

/// Bridges resource requests to remote peers that keep a listen connection
/// open to us.
///
/// Each peer gets one channel for as long as its `listen` context lives.
/// `has_resource` and `get_resource` push a request down the live channels
/// and wait for the peer to answer through `respond`.
pub struct EventStream {
    config: Config,
    registry: Arc<ChannelRegistry>,
    correlator: Correlator,
    next_seq: AtomicU64,
    round_robin: AtomicUsize,
}

impl EventStream {
    pub fn new(config: Config) -> Result<Self, Error> {
        Self::with_registry(config, Arc::new(ChannelRegistry::new()))
    }

    /// Creates a stream around an existing registry.
    pub fn with_registry(
        config: Config,
        registry: Arc<ChannelRegistry>,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            correlator: Correlator::default(),
            next_seq: AtomicU64::new(0),
            round_robin: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Opens a channel for a newly connected peer.
    ///
    /// The returned subscription first yields the `InitConnect` handshake
    /// carrying the channel's ID, then every request routed to this peer. The
    /// channel stays registered until `ctx` is cancelled or the subscription
    /// is dropped.
    pub async fn listen(
        &self,
        ctx: CancellationToken,
        origin: Option<String>,
    ) -> Result<EventSubscription, Error> {
        let (tx, rx) = mpsc::channel(self.config.request_queue_size);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(Channel::new(seq, origin, tx, ctx.child_token()));
        let channel_id = channel.id();

        // queued before the channel is visible so nothing can overtake it
        let handshake = serde_json::to_vec(&ConnectedCompleted { channel_id })?;
        channel.push(RequestEvent::new(Method::InitConnect, handshake))?;

        self.registry.add(channel.clone()).await;
        info!(
            channel = %channel_id,
            origin = channel.origin().unwrap_or("unknown"),
            "add new connection"
        );

        let subscription = EventSubscription {
            channel_id,
            rx,
            closed: channel.closed_token(),
        };

        let registry = self.registry.clone();
        let span = debug_span!("channel", id = %channel_id);
        tokio::spawn(
            async move {
                select! {
                    _ = ctx.cancelled() => debug!("listen context cancelled"),
                    _ = channel.peer_gone() => debug!("peer dropped its subscription"),
                }
                channel.close();
                registry.remove(&channel_id).await;
                info!("remove connection");
            }
            .instrument(span),
        );

        Ok(subscription)
    }

    /// Delivers a peer's response to the request waiting on its ID. Returns
    /// false when nobody is waiting; the response is then dropped.
    pub fn respond(&self, response: ResponseEvent) -> bool {
        self.correlator.resolve(response)
    }

    /// Snapshot of the live channels.
    pub async fn channels(&self) -> Vec<Arc<Channel>> {
        self.registry.list().await
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_requests()
    }

    pub async fn has_resource(
        &self,
        ctx: &CancellationToken,
        resource_id: &str,
    ) -> Result<bool, Error> {
        let payload = self.request(ctx, Method::HasResource, resource_id).await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    pub async fn get_resource(
        &self,
        ctx: &CancellationToken,
        resource_id: &str,
    ) -> Result<Vec<u8>, Error> {
        self.request(ctx, Method::GetResource, resource_id).await
    }

    async fn request(
        &self,
        ctx: &CancellationToken,
        method: Method,
        resource_id: &str,
    ) -> Result<Vec<u8>, Error> {
        let payload = serde_json::to_vec(&ResourceRequest {
            resource_id: resource_id.to_owned(),
        })?;
        let targets = self.select_targets(self.registry.list().await);
        debug!(%method, resource_id, targets = targets.len(), "sending request");
        self.correlator
            .send_request(ctx, targets, method, payload, self.config.request_timeout)
            .await
    }

    fn select_targets(&self, mut channels: Vec<Arc<Channel>>) -> Vec<Arc<Channel>> {
        match self.config.selection {
            SelectionPolicy::Broadcast => channels,
            SelectionPolicy::RoundRobin if channels.is_empty() => channels,
            SelectionPolicy::RoundRobin => {
                let turn = self.round_robin.fetch_add(1, Ordering::Relaxed);
                let chosen = channels.swap_remove(turn % channels.len());
                vec![chosen]
            }
        }
    }
}

#[async_trait]
impl Resourcer for EventStream {
    async fn get_resource(
        &self,
        ctx: &CancellationToken,
        resource_id: &str,
    ) -> Result<Vec<u8>, Error> {
        EventStream::get_resource(self, ctx, resource_id).await
    }

    async fn has_resource(
        &self,
        ctx: &CancellationToken,
        resource_id: &str,
    ) -> Result<bool, Error> {
        EventStream::has_resource(self, ctx, resource_id).await
    }
}

/// The peer's side of a channel: the events pushed to it, in order.
#[derive(Debug)]
pub struct EventSubscription {
    channel_id: ChannelId,
    rx: mpsc::Receiver<RequestEvent>,
    closed: CancellationToken,
}

impl EventSubscription {
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Next event for the peer, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<RequestEvent> {
        select! {
            biased;
            _ = self.closed.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = RequestEvent> {
        stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}
