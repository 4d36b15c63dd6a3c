use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chat_export::download::{Downloader, DownloaderConfig, TaskHandle};
use chat_export::fetch::{
    CHUNK_SIZE, ChunkFetch, ContentRef, FetchError, OwnerId, Resolution, ResolveReferences,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(20);

fn pattern_byte(position: u64) -> u8 {
    ((position * 31 + 7) % 251) as u8
}

fn expected_bytes(size: u64) -> Vec<u8> {
    (0..size).map(pattern_byte).collect()
}

/// Serves a deterministic byte pattern. References starting with `stale-`
/// always report a stale reference.
struct PatternFetch {
    object_size: u64,
    delay: Duration,
    calls: Mutex<Vec<(String, u64)>>,
    failures: Mutex<HashMap<u64, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl PatternFetch {
    fn new(object_size: u64) -> Self {
        Self {
            object_size,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn fail_offset(self, offset: u64, times: usize) -> Self {
        self.failures.lock().expect("failures").insert(offset, times);
        self
    }

    fn calls(&self) -> Vec<(String, u64)> {
        self.calls.lock().expect("calls").clone()
    }
}

#[async_trait]
impl ChunkFetch for PatternFetch {
    async fn fetch(&self, content: &ContentRef, offset: u64) -> Result<Vec<u8>, FetchError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.calls
            .lock()
            .expect("calls")
            .push((content.to_string(), offset));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if content.as_str().starts_with("stale-") {
            return Err(FetchError::StaleReference);
        }
        if let Some(remaining) = self.failures.lock().expect("failures").get_mut(&offset) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::IntegrityMismatch { offset });
            }
        }
        let end = (offset + CHUNK_SIZE).min(self.object_size);
        Ok((offset..end).map(pattern_byte).collect())
    }
}

/// Hands out `fresh-{owner}` for every owner except those listed as gone.
#[derive(Default)]
struct RecordingResolver {
    batches: Mutex<Vec<Vec<OwnerId>>>,
    gone: HashSet<OwnerId>,
}

impl RecordingResolver {
    fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .expect("batches")
            .iter()
            .map(Vec::len)
            .collect()
    }
}

#[async_trait]
impl ResolveReferences for RecordingResolver {
    async fn resolve(
        &self,
        owners: &[OwnerId],
    ) -> Result<HashMap<OwnerId, Resolution>, FetchError> {
        self.batches.lock().expect("batches").push(owners.to_vec());
        Ok(owners
            .iter()
            .map(|owner| {
                let resolution = if self.gone.contains(owner) {
                    Resolution::Unavailable
                } else {
                    Resolution::Available {
                        content: ContentRef::new(format!("fresh-{owner}")),
                        thumbnail: None,
                    }
                };
                (*owner, resolution)
            })
            .collect())
    }
}

fn config(max_concurrent_downloads: usize) -> DownloaderConfig {
    DownloaderConfig {
        max_concurrent_downloads,
        renew_debounce: Duration::from_millis(500),
        ..DownloaderConfig::default()
    }
}

async fn wait_all(handles: &[TaskHandle]) {
    for handle in handles {
        timeout(WAIT, handle.wait())
            .await
            .unwrap_or_else(|_| panic!("task {} did not finish: {:?}", handle.id(), handle.snapshot()));
    }
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).expect("read output")
}

#[tokio::test]
async fn downloads_multi_chunk_object_in_three_fetches() {
    let dir = tempfile::tempdir().expect("tempdir");
    let size = CHUNK_SIZE * 5 / 2;
    let fetcher = Arc::new(PatternFetch::new(size));
    let downloader = Downloader::new(
        config(4),
        fetcher.clone(),
        Arc::new(RecordingResolver::default()),
    );
    downloader.start();

    let handle = downloader
        .add_task(ContentRef::from("obj"), 1, dir.path().join("obj.bin"), false, size, false)
        .expect("add");
    wait_all(std::slice::from_ref(&handle)).await;

    let mut offsets: Vec<u64> = fetcher.calls().into_iter().map(|(_, offset)| offset).collect();
    offsets.sort_unstable();
    assert_eq!(offsets, vec![0, CHUNK_SIZE, 2 * CHUNK_SIZE]);
    assert_eq!(read(handle.output_path()), expected_bytes(size));
    assert_eq!(handle.written_bytes(), size);
    assert_eq!(downloader.bytes_downloaded(), size);

    downloader.stop().await.expect("stop");
}

#[tokio::test]
async fn failed_chunks_are_retried_until_they_succeed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let size = CHUNK_SIZE * 5 / 2;
    let fetcher = Arc::new(PatternFetch::new(size).fail_offset(CHUNK_SIZE, 3));
    let downloader = Downloader::new(
        config(2),
        fetcher.clone(),
        Arc::new(RecordingResolver::default()),
    );
    downloader.start();

    let handle = downloader
        .add_task(ContentRef::from("obj"), 1, dir.path().join("obj.bin"), false, size, false)
        .expect("add");
    wait_all(std::slice::from_ref(&handle)).await;

    let retried = fetcher
        .calls()
        .iter()
        .filter(|(_, offset)| *offset == CHUNK_SIZE)
        .count();
    assert_eq!(retried, 4);
    assert_eq!(fetcher.calls().len(), 6);
    assert_eq!(read(handle.output_path()), expected_bytes(size));

    downloader.stop().await.expect("stop");
}

#[tokio::test]
async fn promoted_task_finishes_before_earlier_low_priority_work() {
    let dir = tempfile::tempdir().expect("tempdir");
    let big = CHUNK_SIZE * 24;
    let fetcher = Arc::new(PatternFetch::new(big).with_delay(Duration::from_millis(5)));
    let downloader = Downloader::new(
        config(1),
        fetcher.clone(),
        Arc::new(RecordingResolver::default()),
    );
    downloader.start();

    let background = downloader
        .add_task(ContentRef::from("big"), 1, dir.path().join("big.bin"), false, big, false)
        .expect("add");
    while fetcher.calls().is_empty() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let urgent = downloader
        .add_task(
            ContentRef::from("small"),
            2,
            dir.path().join("small.bin"),
            false,
            CHUNK_SIZE * 2,
            false,
        )
        .expect("add");
    urgent.set_priority_high(true);

    timeout(WAIT, urgent.wait()).await.expect("urgent task");
    assert!(urgent.is_high_priority());
    assert!(!background.is_done(), "{:?}", background.snapshot());

    let calls = fetcher.calls();
    let first_small = calls
        .iter()
        .position(|(content, _)| content == "small")
        .expect("small fetched");
    let last_small = calls
        .iter()
        .rposition(|(content, _)| content == "small")
        .expect("small fetched");
    let big_between = calls[first_small..=last_small]
        .iter()
        .filter(|(content, _)| content == "big")
        .count();
    // Units admitted before the promotion may still be on the wire.
    assert!(big_between <= 2, "{calls:?}");

    wait_all(std::slice::from_ref(&background)).await;
    downloader.stop().await.expect("stop");
}

#[tokio::test]
async fn wire_calls_and_units_stay_within_budget() {
    let dir = tempfile::tempdir().expect("tempdir");
    let size = CHUNK_SIZE * 3;
    let fetcher = Arc::new(PatternFetch::new(size).with_delay(Duration::from_millis(2)));
    let downloader = Downloader::new(
        config(2),
        fetcher.clone(),
        Arc::new(RecordingResolver::default()),
    );
    let mut status = downloader.subscribe_status();
    let max_units = Arc::new(AtomicUsize::new(0));
    let watcher = {
        let max_units = Arc::clone(&max_units);
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let active = status.borrow().active_units;
                max_units.fetch_max(active, Ordering::SeqCst);
            }
        })
    };
    downloader.start();

    let handles: Vec<TaskHandle> = (0..6)
        .map(|i| {
            downloader
                .add_task(
                    ContentRef::new(format!("obj-{i}")),
                    i,
                    dir.path().join(format!("obj-{i}.bin")),
                    i % 2 == 0,
                    size,
                    false,
                )
                .expect("add")
        })
        .collect();
    wait_all(&handles).await;
    downloader.stop().await.expect("stop");
    drop(downloader);
    let _ = timeout(WAIT, watcher).await;

    let wire = fetcher.max_in_flight.load(Ordering::SeqCst);
    assert!((1..=2).contains(&wire), "wire calls peaked at {wire}");
    assert!(max_units.load(Ordering::SeqCst) <= 3);
    for handle in &handles {
        assert_eq!(read(handle.output_path()), expected_bytes(size));
    }
}

#[tokio::test]
async fn stale_references_are_renewed_in_batches_of_one_hundred() {
    let dir = tempfile::tempdir().expect("tempdir");
    let size = 1000;
    let fetcher = Arc::new(PatternFetch::new(size));
    let resolver = Arc::new(RecordingResolver::default());
    let downloader = Downloader::new(config(4), fetcher.clone(), resolver.clone());

    let handles: Vec<TaskHandle> = (0..150)
        .map(|owner| {
            downloader
                .add_task(
                    ContentRef::new(format!("stale-{owner}")),
                    owner,
                    dir.path().join(format!("{owner}.bin")),
                    false,
                    size,
                    false,
                )
                .expect("add")
        })
        .collect();
    downloader.start();
    wait_all(&handles).await;

    assert_eq!(resolver.batch_sizes(), vec![100, 50]);
    let mut owners: Vec<OwnerId> = resolver
        .batches
        .lock()
        .expect("batches")
        .iter()
        .flatten()
        .copied()
        .collect();
    owners.sort_unstable();
    assert_eq!(owners, (0..150).collect::<Vec<_>>());
    for handle in &handles {
        assert!(!handle.snapshot().needs_renewal);
        assert_eq!(read(handle.output_path()), expected_bytes(size));
    }

    downloader.stop().await.expect("stop");
}

#[tokio::test]
async fn unavailable_content_completes_with_partial_data() {
    let dir = tempfile::tempdir().expect("tempdir");
    let size = 4096;
    let fetcher = Arc::new(PatternFetch::new(size));
    let resolver = Arc::new(RecordingResolver {
        gone: HashSet::from([7]),
        ..RecordingResolver::default()
    });
    let downloader = Downloader::new(
        DownloaderConfig {
            renew_debounce: Duration::from_millis(20),
            ..config(2)
        },
        fetcher,
        resolver.clone(),
    );
    downloader.start();

    let gone = downloader
        .add_task(ContentRef::from("stale-7"), 7, dir.path().join("gone.bin"), false, size, false)
        .expect("add");
    let renewed = downloader
        .add_task(ContentRef::from("stale-8"), 8, dir.path().join("kept.bin"), false, size, false)
        .expect("add");
    wait_all(&[gone.clone(), renewed.clone()]).await;

    assert_eq!(gone.written_bytes(), size);
    assert_eq!(read(gone.output_path()), vec![0u8; size as usize]);
    assert_eq!(read(renewed.output_path()), expected_bytes(size));
    assert_eq!(resolver.batch_sizes().iter().sum::<usize>(), 2);

    downloader.stop().await.expect("stop");
}

#[tokio::test]
async fn zero_sized_task_creates_empty_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fetcher = Arc::new(PatternFetch::new(0));
    let downloader = Downloader::new(
        config(1),
        fetcher.clone(),
        Arc::new(RecordingResolver::default()),
    );
    downloader.start();

    let handle = downloader
        .add_task(ContentRef::from("empty"), 1, dir.path().join("empty.bin"), false, 0, false)
        .expect("add");
    wait_all(std::slice::from_ref(&handle)).await;

    assert!(read(handle.output_path()).is_empty());
    assert!(fetcher.calls().is_empty());
    downloader.stop().await.expect("stop");
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let downloader = Downloader::new(
        config(1),
        Arc::new(PatternFetch::new(10)),
        Arc::new(RecordingResolver::default()),
    );
    downloader.stop().await.expect("stop before start");

    downloader.start();
    downloader.start();
    assert!(downloader.is_running());
    downloader.stop().await.expect("first stop");
    downloader.stop().await.expect("second stop");
    assert!(!downloader.is_running());

    let handle = downloader
        .add_task(ContentRef::from("late"), 1, dir.path().join("late.bin"), false, 10, false)
        .expect("add while stopped");
    downloader.start();
    wait_all(std::slice::from_ref(&handle)).await;
    assert_eq!(read(handle.output_path()), expected_bytes(10));

    downloader.stop().await.expect("stop");
    let status = downloader.status();
    assert!(!status.running);
    assert_eq!(status.queued_high + status.queued_low + status.active_units, 0);
}
