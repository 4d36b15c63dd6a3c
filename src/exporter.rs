use std::collections::{BTreeSet, HashMap};
use std::io;
use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::ExportConfig;
use crate::download::{DownloadError, Downloader, TaskHandle};
use crate::fetch::{ChunkFetch, ContentRef, FetchError, OwnerId, Resolution, ResolveReferences};
use crate::media::{ExportMessage, MediaKind, media_file_name};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("download error: {0}")]
    Download(#[from] DownloadError),
}

/// Batched message lookup used to refresh stale content references.
#[async_trait]
pub trait MessageLookup: Send + Sync {
    async fn messages(&self, ids: &[OwnerId]) -> Result<Vec<ExportMessage>, FetchError>;
}

/// Answers renewal requests by re-reading the owning messages.
pub struct MessageResolver<L> {
    lookup: L,
}

impl<L: MessageLookup> MessageResolver<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl<L: MessageLookup> ResolveReferences for MessageResolver<L> {
    async fn resolve(
        &self,
        owners: &[OwnerId],
    ) -> Result<HashMap<OwnerId, Resolution>, FetchError> {
        let messages = self.lookup.messages(owners).await?;
        Ok(messages
            .into_iter()
            .filter(|message| owners.contains(&message.id))
            .map(|message| (message.id, message.resolution()))
            .collect())
    }
}

/// One file to download.
#[derive(Debug, Clone)]
pub struct MediaRequest {
    pub content_ref: ContentRef,
    pub owner_id: OwnerId,
    /// Deduplication key, e.g. `"42"` or `"42_thumb"`.
    pub output_id: String,
    pub dir: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub is_thumbnail: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaProgress {
    pub queued: usize,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
}

/// Turns exported messages into downloads and tracks their progress.
pub struct MediaExporter {
    config: ExportConfig,
    excluded: BTreeSet<MediaKind>,
    downloader: Downloader,
    downloads: Mutex<HashMap<String, TaskHandle>>,
    watchers: Mutex<JoinSet<()>>,
    progress: Arc<watch::Sender<MediaProgress>>,
}

impl MediaExporter {
    pub fn new(
        config: ExportConfig,
        fetcher: Arc<dyn ChunkFetch>,
        resolver: Arc<dyn ResolveReferences>,
    ) -> Self {
        let downloader = Downloader::new(config.downloader(), fetcher, resolver);
        let (progress, _) = watch::channel(MediaProgress::default());
        Self {
            excluded: config.excluded_media(),
            config,
            downloader,
            downloads: Mutex::new(HashMap::new()),
            watchers: Mutex::new(JoinSet::new()),
            progress: Arc::new(progress),
        }
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn progress(&self) -> watch::Receiver<MediaProgress> {
        self.progress.subscribe()
    }

    pub fn run(&self) {
        self.downloader.start();
    }

    /// Queues a download unless one with the same output id exists, in
    /// which case the existing handle is returned.
    pub async fn add(&self, request: MediaRequest) -> Result<TaskHandle, ExportError> {
        if let Some(existing) = self.downloads().get(&request.output_id) {
            return Ok(existing.clone());
        }
        tokio::fs::create_dir_all(&request.dir).await?;

        let handle = {
            let mut downloads = self.downloads();
            if let Some(existing) = downloads.get(&request.output_id) {
                return Ok(existing.clone());
            }
            let handle = self.downloader.add_task(
                request.content_ref,
                request.owner_id,
                request.dir.join(&request.file_name),
                false,
                request.size,
                request.is_thumbnail,
            )?;
            downloads.insert(request.output_id.clone(), handle.clone());
            handle
        };

        self.progress.send_modify(|progress| {
            progress.queued += 1;
            progress.total_bytes += request.size;
        });
        debug!(
            output_id = %request.output_id,
            owner_id = request.owner_id,
            size = request.size,
            "media queued"
        );

        let watcher = handle.clone();
        let progress = Arc::clone(&self.progress);
        self.watchers().spawn(async move {
            watcher.wait().await;
            progress.send_modify(|progress| {
                progress.queued = progress.queued.saturating_sub(1);
                progress.downloaded_bytes += watcher.size();
            });
        });
        Ok(handle)
    }

    /// Queues the message's file and thumbnail. Excluded kinds, inline
    /// kinds, missing files and files over the size limit are skipped.
    pub async fn export_message(
        &self,
        message: &ExportMessage,
    ) -> Result<Vec<TaskHandle>, ExportError> {
        let requests = self.requests_for(message);
        let mut handles = Vec::with_capacity(requests.len());
        for request in requests {
            handles.push(self.add(request).await?);
        }
        Ok(handles)
    }

    fn requests_for(&self, message: &ExportMessage) -> Vec<MediaRequest> {
        let Some(media) = message.media.as_ref() else {
            return Vec::new();
        };
        let Some(dir_name) = media.kind.dir_name() else {
            return Vec::new();
        };
        if self.excluded.contains(&media.kind) {
            return Vec::new();
        }
        let Some(file) = media.file.as_ref() else {
            return Vec::new();
        };
        let size = match file.size {
            Some(size) if size <= self.config.size_limit_bytes() || !media.kind.has_size_limit() => {
                size
            }
            _ => {
                debug!(message_id = message.id, kind = %media.kind, "media over size limit");
                return Vec::new();
            }
        };

        let chat_dir = self.config.output_dir.join(message.chat_id.to_string());
        let mut rng = rand::thread_rng();
        let mut requests = vec![MediaRequest {
            content_ref: file.content_ref.clone(),
            owner_id: message.id,
            output_id: message.id.to_string(),
            dir: chat_dir.join(dir_name),
            file_name: media_file_name(
                media.kind,
                file.mime_type.as_deref(),
                message.date,
                &mut rng,
            ),
            size,
            is_thumbnail: false,
        }];

        if let Some(thumb) = file.thumbnail.as_ref() {
            match thumb.size {
                Some(size) => requests.push(MediaRequest {
                    content_ref: thumb.content_ref.clone(),
                    owner_id: message.id,
                    output_id: format!("{}_thumb", message.id),
                    dir: chat_dir.join("thumbs"),
                    file_name: media_file_name(MediaKind::Photo, None, message.date, &mut rng)
                        .replacen("photo", "thumbnail", 1),
                    size,
                    is_thumbnail: true,
                }),
                None => debug!(message_id = message.id, "thumbnail without size skipped"),
            }
        }
        requests
    }

    /// Moves every listed download that is still pending to the high tier
    /// and waits for all of them.
    pub async fn wait(&self, output_ids: &[String]) {
        let pending: Vec<TaskHandle> = {
            let downloads = self.downloads();
            output_ids
                .iter()
                .filter_map(|id| downloads.get(id))
                .filter(|handle| !handle.is_done())
                .cloned()
                .collect()
        };
        for handle in &pending {
            handle.set_priority_high(true);
        }
        join_all(pending.iter().map(TaskHandle::wait)).await;
    }

    /// Waits for every tracked download, then stops the downloader.
    pub async fn stop(&self) -> Result<(), ExportError> {
        let handles: Vec<TaskHandle> = self.downloads().values().cloned().collect();
        join_all(handles.iter().map(TaskHandle::wait)).await;

        let mut watchers = mem::take(&mut *self.watchers());
        while watchers.join_next().await.is_some() {}

        self.downloader.stop().await?;
        let progress = self.progress.borrow().clone();
        info!(
            files = handles.len(),
            bytes = progress.downloaded_bytes,
            "media export finished"
        );
        Ok(())
    }

    fn downloads(&self) -> MutexGuard<'_, HashMap<String, TaskHandle>> {
        self.downloads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watchers(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
