use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    Error, Info, Kind, Mount, MountReference, Resourcer, SequentialReader, Stat,
};

/// A mount whose bytes live with a remote peer and are pulled through a
/// [`Resourcer`] on every fetch.
///
/// Existence and size are cached from the last probe or fetch and are only a
/// hint. The mount never reports itself ready, so the engine goes through
/// `fetch` for every access.
pub struct RemoteMount {
    resource_id: String,
    resourcer: Arc<dyn Resourcer>,
    exists: AtomicBool,
    size: AtomicU64,
}

impl RemoteMount {
    /// Builds a mount and probes the peer once for the resource.
    pub async fn new(
        ctx: &CancellationToken,
        resource_id: impl Into<String>,
        resourcer: Arc<dyn Resourcer>,
    ) -> Result<Self, Error> {
        let mount = Self::unprobed(resource_id.into(), resourcer);
        mount.refresh(ctx).await?;
        Ok(mount)
    }

    /// Rebuilds a mount from a persisted reference. Cached state starts empty
    /// until the next `refresh` or `fetch`.
    pub fn deserialize(
        reference: &[u8],
        resourcer: Arc<dyn Resourcer>,
    ) -> Result<Self, Error> {
        let MountReference { resource_id } = MountReference::from_bytes(reference)?;
        Ok(Self::unprobed(resource_id, resourcer))
    }

    fn unprobed(resource_id: String, resourcer: Arc<dyn Resourcer>) -> Self {
        Self {
            resource_id,
            resourcer,
            exists: AtomicBool::new(false),
            size: AtomicU64::new(0),
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Asks the peer again whether it has the resource.
    pub async fn refresh(&self, ctx: &CancellationToken) -> Result<bool, Error> {
        let exists = self.resourcer.has_resource(ctx, &self.resource_id).await?;
        self.exists.store(exists, Ordering::Release);
        debug!(resource = %self.resource_id, exists, "probed remote resource");
        Ok(exists)
    }
}

#[async_trait]
impl Mount for RemoteMount {
    async fn fetch(&self, ctx: &CancellationToken) -> Result<SequentialReader, Error> {
        let data = self.resourcer.get_resource(ctx, &self.resource_id).await?;
        self.size.store(data.len() as u64, Ordering::Release);
        self.exists.store(true, Ordering::Release);
        debug!(resource = %self.resource_id, size = data.len(), "fetched remote resource");
        Ok(SequentialReader::new(data))
    }

    fn info(&self) -> Info {
        Info {
            kind: Kind::Remote,
            access_sequential: true,
            access_seek: false,
            access_random: false,
        }
    }

    async fn stat(&self, _ctx: &CancellationToken) -> Result<Stat, Error> {
        Ok(Stat {
            exists: self.exists.load(Ordering::Acquire),
            size: self.size.load(Ordering::Acquire),
            ready: false,
        })
    }

    fn serialize(&self) -> Result<Vec<u8>, Error> {
        MountReference {
            resource_id: self.resource_id.clone(),
        }
        .to_bytes()
    }

    fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}
