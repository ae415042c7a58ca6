//! Device-facing request model.

use std::num::NonZeroU32;

use blkrelay_backing::{Completion, SECTOR_SHIFT};

/// Operation carried by a relay request.
#[derive(Debug)]
pub enum IoOp {
    /// Read `sectors` sectors into a fresh buffer returned via the completion.
    Read { sectors: u32 },
    /// Write `data`, which must be a whole number of sectors.
    Write { data: Vec<u8> },
    /// Flush completed writes on the backing store.
    Flush,
}

/// One request against a relay device.
#[derive(Debug)]
pub struct IoRequest {
    pub op: IoOp,
    /// First sector of the transfer.
    pub sector: u64,
    pub completion: Completion,
}

impl IoRequest {
    pub fn read(sector: u64, sectors: u32, completion: Completion) -> Self {
        Self {
            op: IoOp::Read { sectors },
            sector,
            completion,
        }
    }

    pub fn write(sector: u64, data: Vec<u8>, completion: Completion) -> Self {
        Self {
            op: IoOp::Write { data },
            sector,
            completion,
        }
    }

    pub fn flush(completion: Completion) -> Self {
        Self {
            op: IoOp::Flush,
            sector: 0,
            completion,
        }
    }

    /// Transfer length in sectors (zero for flush).
    pub fn sectors(&self) -> u64 {
        match &self.op {
            IoOp::Read { sectors } => *sectors as u64,
            IoOp::Write { data } => (data.len() >> SECTOR_SHIFT) as u64,
            IoOp::Flush => 0,
        }
    }
}

/// Per-device transfer limits applied before forwarding.
///
/// Transfers larger than `max_sectors` are split into parts that are admitted
/// and forwarded independently and complete as one request.
#[derive(Clone, Copy, Debug, Default)]
pub struct SubmitLimits {
    pub max_sectors: Option<NonZeroU32>,
}

impl SubmitLimits {
    /// Split transfers larger than `limit` sectors; `0` means unlimited.
    pub fn with_max_sectors(limit: u32) -> Self {
        Self {
            max_sectors: NonZeroU32::new(limit),
        }
    }
}
