//! Backing-store abstractions for the block relay.
//!
//! A relay device forwards every request it receives to a backing store. This
//! crate defines the transfer/completion vocabulary ([`BackingIo`],
//! [`IoResult`], [`Completion`]) and the [`BackingStore`] trait the relay
//! submits through, plus two implementations:
//!
//! - [`FileBacking`]: a file or block-device node driven by a worker pool
//! - [`MemBacking`]: an in-memory store for tests and self-checks

mod error;
mod file;
mod io;
mod store;

pub use error::{BackingError, Result};
pub use file::{FileBacking, DEFAULT_IO_WORKERS};
pub use io::{
    completion_channel, BackingIo, BackingIoKind, Completion, CompletionWaiter, IoResult, IoStatus,
    SECTOR_SHIFT, SECTOR_SIZE,
};
pub use store::{BackingStore, MemBacking};
