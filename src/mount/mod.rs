use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::event;

mod remote;

pub use remote::RemoteMount;

// The pull-based resource contract the shard engine drives.
//
// A mount knows how to produce the bytes of one shard on demand. The engine
// calls `fetch` whenever it needs the data and uses `info` and `stat` to
// decide how to treat what comes back.

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Bridge(#[from] event::Error),
    #[error("failed to encode mount reference: {0}")]
    EncodeReference(String),
    #[error("malformed mount reference: {0}")]
    MalformedReference(String),
}

/// Something that can answer resource requests, usually an
/// [`event::EventStream`].
#[async_trait]
pub trait Resourcer: Send + Sync {
    async fn get_resource(
        &self,
        ctx: &CancellationToken,
        resource_id: &str,
    ) -> Result<Vec<u8>, event::Error>;

    async fn has_resource(
        &self,
        ctx: &CancellationToken,
        resource_id: &str,
    ) -> Result<bool, event::Error>;
}

#[async_trait]
pub trait Mount: Send + Sync {
    /// Retrieves the content. Every call is a fresh retrieval.
    async fn fetch(&self, ctx: &CancellationToken) -> Result<SequentialReader, Error>;

    /// Describes what kind of access the content supports.
    fn info(&self) -> Info;

    async fn stat(&self, ctx: &CancellationToken) -> Result<Stat, Error>;

    /// Produces a reference that can be persisted and later turned back into
    /// an equivalent mount.
    fn serialize(&self) -> Result<Vec<u8>, Error>;

    fn close(&self) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Kind {
    #[default]
    Unknown,
    /// Data lives on the local filesystem.
    Local,
    /// Data has to be retrieved from somewhere else on every access.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Info {
    pub kind: Kind,
    pub access_sequential: bool,
    pub access_seek: bool,
    pub access_random: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    pub exists: bool,
    pub size: u64,
    /// Whether the data is materialized locally and can be read without a
    /// fetch.
    pub ready: bool,
}

/// Persisted form of a mount. Only the resource identifier survives: channel
/// state never outlives the process.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct MountReference {
    pub resource_id: String,
}

impl MountReference {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<_, 256>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| Error::EncodeReference(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        // archived data must be aligned, persisted bytes may not be
        let mut aligned = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<MountReference>(&aligned)
            .map_err(|e| Error::MalformedReference(e.to_string()))
    }
}

/// Reads fetched content front to back exactly once. It deliberately does not
/// implement `Seek`.
#[derive(Debug)]
pub struct SequentialReader {
    data: Vec<u8>,
    pos: usize,
}

impl SequentialReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let rest = &self.data[self.pos..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        n
    }
}

impl io::Read for SequentialReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_into(buf))
    }
}

impl AsyncRead for SequentialReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let rest = &this.data[this.pos..];
        let n = rest.len().min(buf.remaining());
        buf.put_slice(&rest[..n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[test]
    fn test_reference_survives_encoding() {
        let reference = MountReference {
            resource_id: "bafy123".into(),
        };
        let bytes = reference.to_bytes().unwrap();
        assert_eq!(MountReference::from_bytes(&bytes).unwrap(), reference);
    }

    #[test]
    fn test_garbage_reference_is_rejected() {
        let err = MountReference::from_bytes(&[0xff; 3]).unwrap_err();
        assert!(matches!(err, Error::MalformedReference(_)));
    }

    #[test]
    fn test_reader_is_one_shot() {
        let mut reader = SequentialReader::new(b"hello".to_vec());
        let mut out = Vec::new();
        io::Read::read_to_end(&mut reader, &mut out).unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(reader.remaining(), 0);

        let mut again = Vec::new();
        assert_eq!(io::Read::read_to_end(&mut reader, &mut again).unwrap(), 0);
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_reader_async_in_small_steps() {
        let mut reader = SequentialReader::new(b"abcdef".to_vec());
        let mut chunk = [0u8; 4];
        assert_eq!(reader.read(&mut chunk).await.unwrap(), 4);
        assert_eq!(&chunk, b"abcd");
        assert_eq!(reader.read(&mut chunk).await.unwrap(), 2);
        assert_eq!(&chunk[..2], b"ef");
        assert_eq!(reader.read(&mut chunk).await.unwrap(), 0);
    }
}
