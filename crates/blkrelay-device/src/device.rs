//! The relay device proper: admission, forwarding and teardown.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use blkrelay_backing::{
    BackingIo, BackingStore, Completion, DEFAULT_IO_WORKERS, FileBacking, IoResult, SECTOR_SHIFT,
};

use crate::error::CreateError;
use crate::inflight::InflightGate;
use crate::registry::DeviceRegistry;
use crate::request::{IoOp, IoRequest, SubmitLimits};
use crate::split::{alloc_zeroed, split_for_limits, SplitPlan};

/// Configuration for [`RelayDevice::create`].
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Registry name of the relay device.
    pub name: String,
    /// Path to the backing file or block-device node.
    pub backing_path: PathBuf,
    /// Worker threads for the backing store; `0` selects the default.
    pub io_workers: usize,
    pub limits: SubmitLimits,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, backing_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            backing_path: backing_path.into(),
            io_workers: 0,
            limits: SubmitLimits::default(),
        }
    }
}

/// Point-in-time device statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    /// Requests forwarded to the backing store.
    pub submitted: u64,
    /// Requests refused before reaching the backing store.
    pub rejected: u64,
    pub completed_ok: u64,
    pub completed_error: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed_ok: AtomicU64,
    completed_error: AtomicU64,
}

/// A virtual block device that mirrors its backing store.
///
/// The relay adds no caching and no translation: every admitted request is
/// cloned, forwarded to the store, and completed with the store's own status.
/// The in-flight gate ([`InflightGate`]) keeps deletion safe at any moment:
/// once deletion begins new requests are refused, in-flight ones drain, and
/// only then does the device withdraw from its registry.
pub struct RelayDevice {
    name: String,
    capacity_sectors: u64,
    limits: SubmitLimits,
    gate: InflightGate,
    counters: Counters,
    backing: Box<dyn BackingStore>,
    registry: Arc<dyn DeviceRegistry>,
}

impl std::fmt::Debug for RelayDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayDevice")
            .field("name", &self.name)
            .field("capacity_sectors", &self.capacity_sectors)
            .finish_non_exhaustive()
    }
}

impl RelayDevice {
    /// Open the backing path from `config` and bring up a relay in front of it.
    pub fn create(
        config: DeviceConfig,
        registry: Arc<dyn DeviceRegistry>,
    ) -> Result<Arc<Self>, CreateError> {
        let DeviceConfig {
            name,
            backing_path,
            io_workers,
            limits,
        } = config;

        info!(device = %name, path = %backing_path.display(), "opening backing device");
        let workers = if io_workers == 0 {
            DEFAULT_IO_WORKERS
        } else {
            io_workers
        };
        let backing = FileBacking::open_with_workers(&backing_path, workers)?;
        Self::create_with_backing(name, Box::new(backing), limits, registry)
    }

    /// Bring up a relay in front of an already-open store.
    pub fn create_with_backing(
        name: String,
        backing: Box<dyn BackingStore>,
        limits: SubmitLimits,
        registry: Arc<dyn DeviceRegistry>,
    ) -> Result<Arc<Self>, CreateError> {
        let capacity_sectors = backing.capacity_sectors();
        info!(device = %name, sectors = capacity_sectors, "setting device capacity");

        let device = Arc::new(Self {
            name,
            capacity_sectors,
            limits,
            gate: InflightGate::new(),
            counters: Counters::default(),
            backing,
            registry: registry.clone(),
        });

        // Registration comes last: a device visible through the registry is
        // always ready for requests.
        info!(device = %device.name, "registering relay device");
        if let Err(err) = registry.register(&device) {
            device.delete();
            return Err(CreateError::Registration(err));
        }
        Ok(device)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mirrored capacity in 512-byte sectors.
    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    pub fn limits(&self) -> SubmitLimits {
        self.limits
    }

    pub fn is_deleting(&self) -> bool {
        self.gate.is_deleting()
    }

    /// Gate count; includes the device's baseline reference until deletion
    /// drops it, so an idle live device reports 1.
    pub fn in_flight(&self) -> u64 {
        self.gate.outstanding()
    }

    pub fn counters(&self) -> DeviceCounters {
        DeviceCounters {
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
            completed_ok: self.counters.completed_ok.load(Ordering::SeqCst),
            completed_error: self.counters.completed_error.load(Ordering::SeqCst),
        }
    }

    /// Submit one request.
    ///
    /// The request's completion always fires exactly once, on whatever thread
    /// finishes the transfer; that may happen before this call returns.
    /// Completions must not block on the device draining. Requests are
    /// completed with an error status once deletion has begun.
    pub fn submit(self: &Arc<Self>, req: IoRequest) {
        match split_for_limits(req, self.limits) {
            SplitPlan::Empty(completion) => completion.complete(IoResult::ok()),
            SplitPlan::Whole(part) => self.forward(part),
            SplitPlan::Parts(parts) => {
                for part in parts {
                    self.forward(part);
                }
            }
            SplitPlan::Rejected(completion) => self.reject(completion),
        }
    }

    /// Tear the device down: refuse new requests, drain in-flight ones, then
    /// withdraw from the registry.
    ///
    /// Safe to call from several threads; every caller blocks until the drain
    /// has finished. The backing store handle is released when the last
    /// reference to the device goes away.
    pub fn delete(self: &Arc<Self>) {
        if self.gate.begin_delete() {
            info!(device = %self.name, "deleting relay device");
        }
        self.gate.wait_drained();
        self.registry.deregister(&self.name);
    }

    fn reject(&self, completion: Completion) {
        self.counters.rejected.fetch_add(1, Ordering::SeqCst);
        completion.complete(IoResult::io_error());
    }

    fn forward(self: &Arc<Self>, part: IoRequest) {
        let IoRequest {
            op,
            sector,
            completion,
        } = part;

        // Stage the cloned transfer first; a clone that cannot be staged
        // fails without ever touching the gate.
        let io = match op {
            IoOp::Read { sectors } => {
                let Some(buf) = alloc_zeroed((sectors as usize) << SECTOR_SHIFT) else {
                    return self.reject(completion);
                };
                BackingIo::read(sector, buf)
            }
            IoOp::Write { data } => BackingIo::write(sector, data),
            IoOp::Flush => BackingIo::flush(),
        };

        // The deleting flag fails fast; the gate itself is the authoritative
        // admission check.
        if self.gate.is_deleting() || !self.gate.try_acquire() {
            return self.reject(completion);
        }
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);

        let device = self.clone();
        let done = Completion::from_fn(move |result| {
            if result.is_ok() {
                device.counters.completed_ok.fetch_add(1, Ordering::SeqCst);
            } else {
                device.counters.completed_error.fetch_add(1, Ordering::SeqCst);
            }
            completion.complete(result);
            // Release last, so a finished drain implies completions have run.
            device.gate.release();
        });
        self.backing.submit(io, done);
    }
}
