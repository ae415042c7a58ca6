//! Splitting oversized requests into independently forwarded parts.
//!
//! A split request behaves like the original to its submitter: the parent
//! completion fires once, after every part has finished, with the combined
//! status and (for reads) the reassembled data. Each part travels through the
//! normal admission path, so parts are counted in flight individually.

use std::sync::{Arc, Mutex};

use blkrelay_backing::{Completion, IoResult, SECTOR_SHIFT};

use crate::request::{IoOp, IoRequest, SubmitLimits};

/// How a request should proceed after the limits are applied.
pub(crate) enum SplitPlan {
    /// Zero-length transfer; complete immediately with success.
    Empty(Completion),
    /// Forward as a single transfer.
    Whole(IoRequest),
    /// Forward as multiple parts chained to one parent completion.
    Parts(Vec<IoRequest>),
    /// Cannot be forwarded (wrapping range, or buffers could not be
    /// staged); fail it.
    Rejected(Completion),
}

pub(crate) fn split_for_limits(req: IoRequest, limits: SubmitLimits) -> SplitPlan {
    let IoRequest {
        op,
        sector,
        completion,
    } = req;
    match op {
        // Flushes carry no payload and are never split.
        IoOp::Flush => SplitPlan::Whole(IoRequest::flush(completion)),
        IoOp::Read { sectors } => split_read(sector, sectors, completion, limits),
        IoOp::Write { data } => split_write(sector, data, completion, limits),
    }
}

/// Allocate a zeroed transfer buffer, reporting failure instead of aborting.
pub(crate) fn alloc_zeroed(len: usize) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).ok()?;
    buf.resize(len, 0);
    Some(buf)
}

fn split_read(
    sector: u64,
    sectors: u32,
    completion: Completion,
    limits: SubmitLimits,
) -> SplitPlan {
    if sectors == 0 {
        return SplitPlan::Empty(completion);
    }
    // A range that wraps the sector space can never be in bounds; refuse it
    // here so no part is ever placed at a wrapped offset.
    if sector.checked_add(sectors as u64).is_none() {
        return SplitPlan::Rejected(completion);
    }
    let max = match limits.max_sectors {
        Some(max) if sectors > max.get() => max.get(),
        _ => return SplitPlan::Whole(IoRequest::read(sector, sectors, completion)),
    };

    // The parent buffer is reassembled in place from part completions.
    let Some(buf) = alloc_zeroed((sectors as usize) << SECTOR_SHIFT) else {
        return SplitPlan::Rejected(completion);
    };

    let count = sectors.div_ceil(max) as usize;
    let state = FanoutState::shared(completion, count, Some(buf));
    let mut parts = Vec::with_capacity(count);
    let mut offset = 0u32;
    while offset < sectors {
        let part_sectors = max.min(sectors - offset);
        parts.push(IoRequest::read(
            sector + offset as u64,
            part_sectors,
            part_completion(state.clone(), (offset as usize) << SECTOR_SHIFT),
        ));
        offset += part_sectors;
    }
    SplitPlan::Parts(parts)
}

fn split_write(
    sector: u64,
    data: Vec<u8>,
    completion: Completion,
    limits: SubmitLimits,
) -> SplitPlan {
    if data.is_empty() {
        return SplitPlan::Empty(completion);
    }
    if sector.checked_add((data.len() >> SECTOR_SHIFT) as u64).is_none() {
        return SplitPlan::Rejected(completion);
    }
    let max_bytes = match limits.max_sectors {
        Some(max) if data.len() > (max.get() as usize) << SECTOR_SHIFT => {
            (max.get() as usize) << SECTOR_SHIFT
        }
        _ => return SplitPlan::Whole(IoRequest::write(sector, data, completion)),
    };

    // Stage every part buffer before handing the parent to the fan-out, so a
    // failed allocation can still reject the request as a unit.
    let mut staged = Vec::new();
    for chunk in data.chunks(max_bytes) {
        let Some(part) = clone_chunk(chunk) else {
            return SplitPlan::Rejected(completion);
        };
        staged.push(part);
    }

    let state = FanoutState::shared(completion, staged.len(), None);
    let mut parts = Vec::with_capacity(staged.len());
    let mut offset = 0u64;
    for part_data in staged {
        let part_sectors = (part_data.len() >> SECTOR_SHIFT) as u64;
        parts.push(IoRequest::write(
            sector + offset,
            part_data,
            part_completion(state.clone(), 0),
        ));
        offset += part_sectors;
    }
    SplitPlan::Parts(parts)
}

fn clone_chunk(chunk: &[u8]) -> Option<Vec<u8>> {
    let mut part = Vec::new();
    part.try_reserve_exact(chunk.len()).ok()?;
    part.extend_from_slice(chunk);
    Some(part)
}

/// Aggregate of an in-progress fan-out.
///
/// Any part failure fails the parent; a read parent additionally collects the
/// part payloads at their byte offsets. The parent completion is always fired
/// outside the lock.
struct FanoutState {
    parent: Option<Completion>,
    remaining: usize,
    failed: bool,
    read_buf: Option<Vec<u8>>,
}

impl FanoutState {
    fn shared(
        parent: Completion,
        parts: usize,
        read_buf: Option<Vec<u8>>,
    ) -> Arc<Mutex<FanoutState>> {
        Arc::new(Mutex::new(Self {
            parent: Some(parent),
            remaining: parts,
            failed: false,
            read_buf,
        }))
    }

    fn absorb(&mut self, byte_offset: usize, result: IoResult) {
        debug_assert!(self.remaining > 0, "fan-out part completed twice");
        self.remaining -= 1;
        if !result.is_ok() {
            self.failed = true;
            return;
        }
        if let (Some(buf), Some(data)) = (self.read_buf.as_mut(), result.data) {
            buf[byte_offset..byte_offset + data.len()].copy_from_slice(&data);
        }
    }

    fn finish_if_drained(&mut self) -> Option<(Completion, IoResult)> {
        if self.remaining != 0 {
            return None;
        }
        let completion = self.parent.take()?;
        let result = if self.failed {
            IoResult::io_error()
        } else if let Some(buf) = self.read_buf.take() {
            IoResult::ok_with_data(buf)
        } else {
            IoResult::ok()
        };
        Some((completion, result))
    }
}

fn part_completion(state: Arc<Mutex<FanoutState>>, byte_offset: usize) -> Completion {
    Completion::from_fn(move |result| {
        let finished = {
            let mut state = state.lock().expect("mutex poisoned");
            state.absorb(byte_offset, result);
            state.finish_if_drained()
        };
        if let Some((completion, result)) = finished {
            completion.complete(result);
        }
    })
}
