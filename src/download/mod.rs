//! Concurrent chunked downloader: a single scheduler task owns two priority
//! tiers and fans chunks out to transfer units, with batched renewal of
//! stale content references.

mod downloader;
mod errors;
mod io_pool;
mod queue;
mod renewal;
mod task;
mod unit;

pub use downloader::{
    DEFAULT_MAX_CONCURRENT_DOWNLOADS, Downloader, DownloaderConfig, DownloaderStatus,
    RENEW_BATCH_LIMIT, RENEW_DEBOUNCE, WAKEUP_TIMEOUT,
};
pub use errors::DownloadError;
pub use task::{TaskHandle, TaskSnapshot};
