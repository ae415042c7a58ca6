//! A transparent relay block device.
//!
//! A relay device mirrors a backing store sector for sector: every request
//! submitted to the relay is cloned, forwarded to the store, and completed
//! with the store's own status. What makes the relay interesting is that it
//! can be deleted at any moment while requests are in flight: a lock-free
//! in-flight gate refuses new requests, lets the outstanding ones drain, and
//! only then releases the device and its backing handle.
//!
//! The building blocks:
//!
//! - [`RelayDevice`]: admission, forwarding, splitting and teardown
//! - [`DeviceRegistry`] / [`DeviceTable`]: where live devices are looked up
//! - [`IoRequest`] / [`SubmitLimits`]: the request model and per-device limits

mod device;
mod error;
mod inflight;
mod registry;
mod request;
mod split;

pub use device::{DeviceConfig, DeviceCounters, RelayDevice};
pub use error::{CreateError, RegistryError};
pub use registry::{DeviceRegistry, DeviceTable};
pub use request::{IoOp, IoRequest, SubmitLimits};

#[cfg(all(test, not(feature = "loom")))]
mod proptests;
