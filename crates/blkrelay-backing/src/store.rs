//! The store trait and the in-memory reference implementation.

use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::{BackingError, Result};
use crate::io::{BackingIo, BackingIoKind, Completion, IoResult, SECTOR_SHIFT, SECTOR_SIZE};

/// Destination for cloned relay requests.
///
/// `submit` never fails synchronously: any problem with the request is
/// reported through `done`, collapsed to an `IoError` status. Implementations
/// may run the completion on any thread, including inline on the submitting
/// thread before `submit` returns.
pub trait BackingStore: Send + Sync {
    /// Usable capacity in 512-byte sectors.
    fn capacity_sectors(&self) -> u64;

    /// Submit one transfer; buffer ownership travels with `io`.
    fn submit(&self, io: BackingIo, done: Completion);
}

/// Fixed-size in-memory store.
///
/// Completions run inline on the submitting thread, which makes this the
/// harshest exerciser of reentrant completion handling in callers. Cloning
/// shares the underlying buffer.
#[derive(Clone)]
pub struct MemBacking {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemBacking {
    /// Zero-filled store of `sectors` 512-byte sectors.
    pub fn new(sectors: u64) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE])),
        }
    }

    /// Store seeded with `bytes`, which must be sector-aligned.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() % SECTOR_SIZE != 0 {
            return Err(BackingError::UnalignedLength { len: bytes.len() });
        }
        Ok(Self {
            data: Arc::new(Mutex::new(bytes)),
        })
    }

    /// Snapshot of the full store contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().expect("mutex poisoned").clone()
    }

    fn perform(&self, io: BackingIo) -> IoResult {
        match self.try_perform(io) {
            Ok(result) => result,
            Err(err) => {
                warn!(%err, "in-memory backing rejected transfer");
                IoResult::io_error()
            }
        }
    }

    fn try_perform(&self, io: BackingIo) -> Result<IoResult> {
        let BackingIo { sector, kind } = io;
        let mut data = self.data.lock().expect("mutex poisoned");
        match kind {
            BackingIoKind::Read { mut buf } => {
                let range = byte_range(sector, buf.len(), data.len())?;
                buf.copy_from_slice(&data[range]);
                Ok(IoResult::ok_with_data(buf))
            }
            BackingIoKind::Write { data: payload } => {
                let range = byte_range(sector, payload.len(), data.len())?;
                data[range].copy_from_slice(&payload);
                Ok(IoResult::ok())
            }
            BackingIoKind::Flush => Ok(IoResult::ok()),
        }
    }
}

impl BackingStore for MemBacking {
    fn capacity_sectors(&self) -> u64 {
        (self.data.lock().expect("mutex poisoned").len() >> SECTOR_SHIFT) as u64
    }

    fn submit(&self, io: BackingIo, done: Completion) {
        done.complete(self.perform(io));
    }
}

fn byte_range(sector: u64, len: usize, store_len: usize) -> Result<std::ops::Range<usize>> {
    if len % SECTOR_SIZE != 0 {
        return Err(BackingError::UnalignedLength { len });
    }
    let sectors = (len >> SECTOR_SHIFT) as u64;
    let capacity = (store_len >> SECTOR_SHIFT) as u64;
    match sector.checked_add(sectors) {
        Some(end) if end <= capacity => {
            let start = (sector as usize) << SECTOR_SHIFT;
            Ok(start..start + len)
        }
        _ => Err(BackingError::OutOfBounds {
            sector,
            sectors,
            capacity,
        }),
    }
}
