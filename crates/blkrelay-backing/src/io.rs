//! Request and completion vocabulary shared by relay devices and backing stores.
//!
//! All completion is callback-based: a request carries a single-shot
//! [`Completion`] and whoever finishes the request consumes it exactly once.
//! Status reporting is deliberately coarse ([`IoStatus::Ok`] or
//! [`IoStatus::IoError`]); the relay does not distinguish failure causes when
//! propagating them back to submitters.

use std::sync::mpsc;
use std::time::Duration;

/// Sector size exponent; all offsets and transfer lengths are in 512-byte sectors.
pub const SECTOR_SHIFT: u32 = 9;

/// Sector size in bytes.
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

/// Two-state completion status, mirroring what block submitters can act on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoStatus {
    Ok,
    IoError,
}

impl IoStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, IoStatus::Ok)
    }
}

/// Outcome of a finished request.
///
/// `data` is populated for successful reads and hands the filled buffer back
/// to the submitter; it is `None` for writes, flushes and failures.
#[derive(Debug)]
pub struct IoResult {
    pub status: IoStatus,
    pub data: Option<Vec<u8>>,
}

impl IoResult {
    pub fn ok() -> Self {
        Self {
            status: IoStatus::Ok,
            data: None,
        }
    }

    pub fn ok_with_data(data: Vec<u8>) -> Self {
        Self {
            status: IoStatus::Ok,
            data: Some(data),
        }
    }

    pub fn io_error() -> Self {
        Self {
            status: IoStatus::IoError,
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Single-shot completion callback.
///
/// Completing consumes the value, so a request cannot be finished twice. The
/// callback may run on any thread, including the submitting thread before the
/// submit call returns.
pub struct Completion(Box<dyn FnOnce(IoResult) + Send>);

impl Completion {
    pub fn from_fn(f: impl FnOnce(IoResult) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn complete(self, result: IoResult) {
        (self.0)(result)
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Completion")
    }
}

/// Create a [`Completion`] paired with a blocking waiter.
///
/// Useful when a caller wants synchronous semantics on top of the callback
/// interface. The waiter yields `None` if the completion is dropped unfired.
pub fn completion_channel() -> (Completion, CompletionWaiter) {
    let (tx, rx) = mpsc::sync_channel(1);
    let completion = Completion::from_fn(move |result| {
        // The waiter may have given up already; nothing to do then.
        let _ = tx.send(result);
    });
    (completion, CompletionWaiter { rx })
}

pub struct CompletionWaiter {
    rx: mpsc::Receiver<IoResult>,
}

impl CompletionWaiter {
    pub fn wait(self) -> Option<IoResult> {
        self.rx.recv().ok()
    }

    pub fn wait_timeout(self, timeout: Duration) -> Option<IoResult> {
        self.rx.recv_timeout(timeout).ok()
    }
}

/// A single transfer as seen by a backing store.
#[derive(Debug)]
pub struct BackingIo {
    /// First sector of the transfer.
    pub sector: u64,
    pub kind: BackingIoKind,
}

#[derive(Debug)]
pub enum BackingIoKind {
    /// Fill `buf` from the store. The buffer length fixes the transfer size.
    Read { buf: Vec<u8> },
    /// Write `data` to the store.
    Write { data: Vec<u8> },
    /// Persist completed writes.
    Flush,
}

impl BackingIo {
    pub fn read(sector: u64, buf: Vec<u8>) -> Self {
        Self {
            sector,
            kind: BackingIoKind::Read { buf },
        }
    }

    pub fn write(sector: u64, data: Vec<u8>) -> Self {
        Self {
            sector,
            kind: BackingIoKind::Write { data },
        }
    }

    pub fn flush() -> Self {
        Self {
            sector: 0,
            kind: BackingIoKind::Flush,
        }
    }
}
