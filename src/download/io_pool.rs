use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Runs blocking file work on tokio's blocking threads, at most `workers`
/// jobs at a time.
#[derive(Clone)]
pub(crate) struct BlockingPool {
    permits: Arc<Semaphore>,
}

impl BlockingPool {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub(crate) async fn run<F, T>(&self, job: F) -> io::Result<T>
    where
        F: FnOnce() -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| io::Error::other("blocking pool closed"))?;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(io::Error::other)?
    }

    /// Creates (or truncates) `path` and pre-sizes it to `size` bytes.
    pub(crate) async fn open_sized(&self, path: PathBuf, size: u64) -> io::Result<File> {
        self.run(move || open_sized(&path, size)).await
    }

    pub(crate) async fn write_at(
        &self,
        file: Arc<File>,
        offset: u64,
        data: Vec<u8>,
    ) -> io::Result<()> {
        self.run(move || write_at(&file, offset, &data)).await
    }
}

fn open_sized(path: &Path, size: u64) -> io::Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.set_len(size)?;
    Ok(file)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_at(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < data.len() {
        let n = file.seek_write(&data[written..], offset + written as u64)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        written += n;
    }
    Ok(())
}
