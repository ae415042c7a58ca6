//! File-backed store driven by a small worker pool.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::error::{BackingError, Result};
use crate::io::{BackingIo, BackingIoKind, Completion, IoResult, SECTOR_SHIFT, SECTOR_SIZE};
use crate::store::BackingStore;

/// Default number of I/O worker threads per store.
pub const DEFAULT_IO_WORKERS: usize = 2;

struct Job {
    io: BackingIo,
    done: Completion,
}

struct FileShared {
    file: File,
    path: PathBuf,
    capacity_sectors: u64,
}

/// A regular file or block-device node serving relayed transfers.
///
/// Transfers are queued to a fixed pool of worker threads; each worker
/// performs positional I/O against the shared handle, so workers never
/// contend on a file cursor. Dropping the store closes the queue and joins
/// the workers, finishing any transfers still queued.
pub struct FileBacking {
    shared: Arc<FileShared>,
    queue: Option<mpsc::Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBacking")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl FileBacking {
    /// Open `path` read-write with the default worker count.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_workers(path, DEFAULT_IO_WORKERS)
    }

    pub fn open_with_workers(path: impl AsRef<Path>, workers: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| BackingError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_file(file, path.to_path_buf(), workers)
    }

    /// Wrap an already-open handle. `path` is used for diagnostics only.
    pub fn from_file(mut file: File, path: PathBuf, workers: usize) -> Result<Self> {
        // Seek-to-end reports the usable size for device nodes as well as
        // regular files; all subsequent I/O is positional.
        let len = file.seek(SeekFrom::End(0))?;
        if len < SECTOR_SIZE as u64 {
            return Err(BackingError::TooSmall { path, len });
        }

        let shared = Arc::new(FileShared {
            file,
            path,
            capacity_sectors: len >> SECTOR_SHIFT,
        });

        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers)
            .map(|idx| {
                let shared = Arc::clone(&shared);
                let rx = Arc::clone(&rx);
                thread::Builder::new()
                    .name(format!("blkrelay-io-{idx}"))
                    .spawn(move || worker_loop(shared, rx))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        debug!(
            path = %shared.path.display(),
            sectors = shared.capacity_sectors,
            workers,
            "opened backing store"
        );
        Ok(Self {
            shared,
            queue: Some(tx),
            workers: handles,
        })
    }
}

impl BackingStore for FileBacking {
    fn capacity_sectors(&self) -> u64 {
        self.shared.capacity_sectors
    }

    fn submit(&self, io: BackingIo, done: Completion) {
        match &self.queue {
            Some(queue) => {
                if let Err(mpsc::SendError(job)) = queue.send(Job { io, done }) {
                    // Workers are gone; fail the transfer rather than drop it.
                    job.done.complete(IoResult::io_error());
                }
            }
            None => done.complete(IoResult::io_error()),
        }
    }
}

impl Drop for FileBacking {
    fn drop(&mut self) {
        // Closing the queue stops the workers once it drains.
        self.queue.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        debug!(path = %self.shared.path.display(), "releasing backing store handle");
    }
}

fn worker_loop(shared: Arc<FileShared>, rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = {
            let rx = rx.lock().expect("mutex poisoned");
            rx.recv()
        };
        match job {
            Ok(Job { io, done }) => done.complete(shared.perform(io)),
            // Queue closed: the store is shutting down.
            Err(mpsc::RecvError) => return,
        }
    }
}

impl FileShared {
    fn perform(&self, io: BackingIo) -> IoResult {
        match self.try_perform(io) {
            Ok(result) => result,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "backing i/o failed");
                IoResult::io_error()
            }
        }
    }

    fn try_perform(&self, io: BackingIo) -> Result<IoResult> {
        let BackingIo { sector, kind } = io;
        match kind {
            BackingIoKind::Read { mut buf } => {
                let offset = self.byte_offset(sector, buf.len())?;
                read_exact_at(&self.file, &mut buf, offset)?;
                Ok(IoResult::ok_with_data(buf))
            }
            BackingIoKind::Write { data } => {
                let offset = self.byte_offset(sector, data.len())?;
                write_all_at(&self.file, &data, offset)?;
                Ok(IoResult::ok())
            }
            BackingIoKind::Flush => {
                self.file.sync_data()?;
                Ok(IoResult::ok())
            }
        }
    }

    fn byte_offset(&self, sector: u64, len: usize) -> Result<u64> {
        if len % SECTOR_SIZE != 0 {
            return Err(BackingError::UnalignedLength { len });
        }
        let sectors = (len >> SECTOR_SHIFT) as u64;
        match sector.checked_add(sectors) {
            Some(end) if end <= self.capacity_sectors => Ok(sector << SECTOR_SHIFT),
            _ => Err(BackingError::OutOfBounds {
                sector,
                sectors,
                capacity: self.capacity_sectors,
            }),
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut done = 0;
    while done < buf.len() {
        let n = file.seek_read(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read from backing store",
            ));
        }
        done += n;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut done = 0;
    while done < buf.len() {
        let n = file.seek_write(&buf[done..], offset + done as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short write to backing store",
            ));
        }
        done += n;
    }
    Ok(())
}
