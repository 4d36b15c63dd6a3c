use std::io;

use thiserror::Error;

use crate::fetch::FetchError;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("downloader is shut down")]
    Closed,
    #[error("download scheduler task failed: {0}")]
    SchedulerJoin(#[from] tokio::task::JoinError),
}
