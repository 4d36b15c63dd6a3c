use std::sync::Arc;

use async_trait::async_trait;

use super::mirror::{decrypt_chunk, verify_chunk};
use super::sessions::SessionPool;
use super::transport::{
    DcId, FileChunk, FileLocation, MediaSession, MediaTransport, MirrorChunk, MirrorRedirect,
    RpcError, SessionKind,
};
use super::{CHUNK_SIZE, ChunkFetch, ContentRef, FetchError};

const GET_FILE_ATTEMPTS: u32 = 5;
const IMPORT_AUTH_ATTEMPTS: u32 = 3;

/// [`ChunkFetch`] over a media transport: direct reads through cached
/// per-datacenter sessions, falling back to mirror reads with
/// decrypt-and-verify when the origin redirects.
pub struct RemoteFetcher<T: MediaTransport> {
    transport: Arc<T>,
    sessions: SessionPool<T::Session>,
}

impl<T: MediaTransport> RemoteFetcher<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            sessions: SessionPool::new(),
        }
    }

    pub fn sessions(&self) -> &SessionPool<T::Session> {
        &self.sessions
    }

    /// Stops every cached media session.
    pub async fn close(&self) {
        self.sessions.close_all().await;
    }

    async fn media_session(&self, dc_id: DcId) -> Result<Arc<T::Session>, FetchError> {
        self.sessions
            .acquire(dc_id, || self.open_media_session(dc_id))
            .await
    }

    async fn open_media_session(&self, dc_id: DcId) -> Result<T::Session, FetchError> {
        let session = self.transport.open_session(dc_id, SessionKind::Media).await?;
        if dc_id == self.transport.home_dc() {
            return Ok(session);
        }

        match self.import_authorization(&session, dc_id).await {
            Ok(()) => Ok(session),
            Err(err) => {
                session.stop().await;
                Err(err)
            }
        }
    }

    async fn import_authorization(
        &self,
        session: &T::Session,
        dc_id: DcId,
    ) -> Result<(), FetchError> {
        for attempt in 1..=IMPORT_AUTH_ATTEMPTS {
            let exported = self.transport.export_authorization(dc_id).await?;
            match session.import_authorization(&exported).await {
                Ok(()) => return Ok(()),
                Err(RpcError::AuthBytesInvalid) => {
                    tracing::debug!(dc_id, attempt, "authorization import rejected");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(FetchError::TransientAuth {
            attempts: IMPORT_AUTH_ATTEMPTS,
        })
    }

    async fn get_file(
        &self,
        session: &T::Session,
        location: &FileLocation,
        offset: u64,
    ) -> Result<FileChunk, FetchError> {
        for attempt in 1..=GET_FILE_ATTEMPTS {
            match session.get_file(location, offset, CHUNK_SIZE).await {
                Ok(chunk) => return Ok(chunk),
                Err(RpcError::AuthKeyUnregistered) => {
                    tracing::debug!(dc_id = location.dc_id, offset, attempt, "session key not registered");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(FetchError::TransientAuth {
            attempts: GET_FILE_ATTEMPTS,
        })
    }

    async fn fetch_from_mirror(
        &self,
        origin: &T::Session,
        redirect: &MirrorRedirect,
        offset: u64,
    ) -> Result<Vec<u8>, FetchError> {
        let mirror = self
            .transport
            .open_session(redirect.dc_id, SessionKind::Mirror)
            .await?;
        let result = read_mirror(origin, &mirror, redirect, offset).await;
        mirror.stop().await;
        result
    }
}

async fn read_mirror<S: MediaSession>(
    origin: &S,
    mirror: &S,
    redirect: &MirrorRedirect,
    offset: u64,
) -> Result<Vec<u8>, FetchError> {
    loop {
        let chunk = mirror
            .get_mirror_file(&redirect.file_token, offset, CHUNK_SIZE)
            .await?;
        match chunk {
            MirrorChunk::ReuploadNeeded { request_token } => {
                tracing::debug!(dc_id = redirect.dc_id, offset, "mirror asked for reupload");
                origin
                    .reupload_to_mirror(&redirect.file_token, &request_token)
                    .await?;
            }
            MirrorChunk::Bytes(mut bytes) => {
                decrypt_chunk(
                    &mut bytes,
                    &redirect.encryption_key,
                    &redirect.encryption_iv,
                    offset,
                )?;
                let hashes = origin
                    .get_mirror_hashes(&redirect.file_token, offset)
                    .await?;
                verify_chunk(&bytes, offset, &hashes)?;
                return Ok(bytes);
            }
        }
    }
}

#[async_trait]
impl<T> ChunkFetch for RemoteFetcher<T>
where
    T: MediaTransport + 'static,
{
    async fn fetch(&self, content: &ContentRef, offset: u64) -> Result<Vec<u8>, FetchError> {
        let location = self.transport.locate(content)?;
        let session = self.media_session(location.dc_id).await?;
        match self.get_file(&session, &location, offset).await? {
            FileChunk::Bytes(bytes) => Ok(bytes),
            FileChunk::Redirect(redirect) => {
                self.fetch_from_mirror(&session, &redirect, offset).await
            }
        }
    }
}
