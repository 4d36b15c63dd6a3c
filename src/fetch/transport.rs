//! Wire seam for the remote media service. Implementations wrap an already
//! authenticated client; request encoding and the key handshake live there.

use async_trait::async_trait;
use thiserror::Error;

use super::ContentRef;

pub type DcId = i32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("authorization key is not registered")]
    AuthKeyUnregistered,
    #[error("exported authorization bytes are invalid")]
    AuthBytesInvalid,
    #[error("file reference expired")]
    FileReferenceExpired,
    #[error("file reference invalid")]
    FileReferenceInvalid,
    #[error("mirror volume location not found")]
    VolumeLocationNotFound,
    #[error("invalid content reference: {0}")]
    InvalidReference(String),
    #[error("rpc error {code}: {message}")]
    Other { code: i32, message: String },
}

/// Decoded content reference: the datacenter holding the object and the
/// transport-specific location payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub dc_id: DcId,
    pub location: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedAuthorization {
    pub id: i64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRedirect {
    pub dc_id: DcId,
    pub file_token: Vec<u8>,
    pub encryption_key: Vec<u8>,
    pub encryption_iv: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChunk {
    Bytes(Vec<u8>),
    Redirect(MirrorRedirect),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorChunk {
    Bytes(Vec<u8>),
    ReuploadNeeded { request_token: Vec<u8> },
}

/// SHA-256 of `limit` bytes starting at absolute `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHash {
    pub offset: u64,
    pub limit: u64,
    pub hash: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Media,
    Mirror,
}

#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn get_file(
        &self,
        location: &FileLocation,
        offset: u64,
        limit: u64,
    ) -> Result<FileChunk, RpcError>;

    async fn import_authorization(&self, auth: &ExportedAuthorization) -> Result<(), RpcError>;

    async fn get_mirror_file(
        &self,
        file_token: &[u8],
        offset: u64,
        limit: u64,
    ) -> Result<MirrorChunk, RpcError>;

    async fn reupload_to_mirror(
        &self,
        file_token: &[u8],
        request_token: &[u8],
    ) -> Result<(), RpcError>;

    async fn get_mirror_hashes(
        &self,
        file_token: &[u8],
        offset: u64,
    ) -> Result<Vec<ChunkHash>, RpcError>;

    async fn stop(&self);
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    type Session: MediaSession + 'static;

    /// Datacenter the client is logged into; its sessions need no
    /// authorization transfer.
    fn home_dc(&self) -> DcId;

    fn locate(&self, content: &ContentRef) -> Result<FileLocation, RpcError>;

    /// Opens and starts a session to `dc_id`.
    async fn open_session(&self, dc_id: DcId, kind: SessionKind) -> Result<Self::Session, RpcError>;

    /// Exports the home authorization for import on `dc_id`.
    async fn export_authorization(&self, dc_id: DcId) -> Result<ExportedAuthorization, RpcError>;
}
