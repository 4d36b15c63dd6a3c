//! Collaborator contracts consumed by the downloader and the remote chunk
//! fetcher built on a pre-authenticated media transport.

mod mirror;
mod remote;
mod sessions;
mod transport;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use mirror::{decrypt_chunk, mirror_iv, verify_chunk};
pub use remote::RemoteFetcher;
pub use sessions::SessionPool;
pub use transport::{
    ChunkHash, DcId, ExportedAuthorization, FileChunk, FileLocation, MediaSession, MediaTransport,
    MirrorChunk, MirrorRedirect, RpcError, SessionKind,
};

/// Size of one chunk request. Every offset handed to [`ChunkFetch`] is a
/// multiple of this value.
pub const CHUNK_SIZE: u64 = 1024 * 1024;

/// Identifies the message a piece of content belongs to.
pub type OwnerId = i64;

/// Opaque, renewable reference to a remote object's bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentRef(String);

impl ContentRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ContentRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ContentRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Answer for one owner in a renewal lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Available {
        content: ContentRef,
        thumbnail: Option<ContentRef>,
    },
    Unavailable,
}

impl Resolution {
    /// Picks the refreshed reference for a content or thumbnail task.
    /// `None` means the object is gone for that task.
    pub fn content_for(&self, is_thumbnail: bool) -> Option<&ContentRef> {
        match self {
            Resolution::Available { content, thumbnail } => {
                if is_thumbnail {
                    thumbnail.as_ref()
                } else {
                    Some(content)
                }
            }
            Resolution::Unavailable => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("content reference is stale")]
    StaleReference,
    #[error("mirror chunk at offset {offset} failed hash verification")]
    IntegrityMismatch { offset: u64 },
    #[error("authorization failed after {attempts} attempts")]
    TransientAuth { attempts: u32 },
    #[error("content unavailable: {0}")]
    Unavailable(String),
    #[error("rpc error: {0}")]
    Rpc(RpcError),
}

impl FetchError {
    pub fn is_stale(&self) -> bool {
        matches!(self, FetchError::StaleReference)
    }
}

impl From<RpcError> for FetchError {
    fn from(error: RpcError) -> Self {
        match error {
            RpcError::FileReferenceExpired | RpcError::FileReferenceInvalid => {
                FetchError::StaleReference
            }
            other => FetchError::Rpc(other),
        }
    }
}

/// Fetches one chunk of a remote object.
#[async_trait]
pub trait ChunkFetch: Send + Sync {
    async fn fetch(&self, content: &ContentRef, offset: u64) -> Result<Vec<u8>, FetchError>;
}

/// Re-resolves content references for a batch of owners. Owners missing
/// from the returned map are retried in a later batch.
#[async_trait]
pub trait ResolveReferences: Send + Sync {
    async fn resolve(
        &self,
        owners: &[OwnerId],
    ) -> Result<HashMap<OwnerId, Resolution>, FetchError>;
}
