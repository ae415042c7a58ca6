//! Lock-free in-flight accounting that gates device deletion.
//!
//! The gate is a reference count with a baseline of one, held by the device
//! itself from creation until deletion begins. Admitting a request increments
//! the count only while it is non-zero, so once the gate has drained to zero
//! nothing can revive it.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::{AtomicBool, AtomicU64};
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::{AtomicBool, AtomicU64};

use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex};

pub struct InflightGate {
    deleting: AtomicBool,
    inflight: AtomicU64,
    lock: Mutex<()>,
    drained: Condvar,
}

impl InflightGate {
    /// A fresh gate holds one baseline reference on behalf of its owner.
    pub fn new() -> Self {
        Self {
            deleting: AtomicBool::new(false),
            inflight: AtomicU64::new(1),
            lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    /// Admit one request: increment the count unless it has reached zero.
    ///
    /// Returns `false` once the gate has drained; a drained gate stays
    /// drained forever.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.inflight.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return false;
            }
            test_yield();
            match self.inflight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Retire one admitted request, waking drain waiters on the last one out.
    pub fn release(&self) {
        let prev = self.inflight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev != 0, "in-flight count underflow");
        test_yield();
        if prev == 1 {
            self.wake_drained();
        }
    }

    /// Start deletion.
    ///
    /// Protocol:
    /// 1) Latch the deleting flag; only the first caller proceeds.
    /// 2) Drop the baseline reference (decrement-if-positive), so the count
    ///    now reflects in-flight requests alone.
    /// 3) If that drop emptied the gate, wake drain waiters.
    ///
    /// Returns `true` for the caller that performed the drop. Later callers
    /// get `false` and may still [`InflightGate::wait_drained`].
    pub fn begin_delete(&self) -> bool {
        if self.deleting.swap(true, Ordering::SeqCst) {
            return false;
        }
        test_yield();
        let mut current = self.inflight.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                break;
            }
            match self.inflight.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(prev) => {
                    if prev == 1 {
                        self.wake_drained();
                    }
                    break;
                }
                Err(actual) => current = actual,
            }
        }
        true
    }

    /// Block until the count reaches zero.
    pub fn wait_drained(&self) {
        let mut guard = self.lock.lock().expect("mutex poisoned");
        while self.inflight.load(Ordering::SeqCst) != 0 {
            guard = self.drained.wait(guard).expect("mutex poisoned");
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deleting.load(Ordering::SeqCst)
    }

    /// Current count. Includes the baseline reference until deletion drops it.
    pub fn outstanding(&self) -> u64 {
        self.inflight.load(Ordering::SeqCst)
    }

    fn wake_drained(&self) {
        // Taking the lock orders this wake after any waiter that saw a
        // non-zero count and is entering the condvar.
        let _guard = self.lock.lock().expect("mutex poisoned");
        self.drained.notify_all();
    }
}

impl Default for InflightGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, feature = "loom"))]
#[inline]
fn test_yield() {
    loom::thread::yield_now();
}

#[cfg(all(test, not(feature = "loom")))]
#[inline]
fn test_yield() {
    std::thread::yield_now();
}

#[cfg(not(test))]
#[inline]
fn test_yield() {}
