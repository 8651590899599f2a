//! # Kernel synchronization primitives
//!
//! Busy-waiting locks for code that runs beneath any scheduler: the frame
//! allocator, address-space bookkeeping and the kernel heap. Nothing in here
//! sleeps, so every primitive is usable from interrupt and fault handlers.
//!
//! - [`Mutex`] is generic over a raw lock ([`RawSpin`] or [`RawTicket`]) and
//!   hands out RAII guards that release on every exit path, unwinding included.
//! - [`IrqGuard`] is the critical section: it masks interrupts on the current
//!   CPU and restores the previous state on drop. [`Mutex::lock_irq`] pairs
//!   both, which is mandatory for any lock that a fault or interrupt handler
//!   may also take.
//! - [`SyncOnceCell`] holds the boot-time singletons.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(all(not(target_os = "none"), not(test)))]
extern crate std;

mod backoff;
pub mod irq;
mod mutex;
mod raw_spin;
mod raw_ticket;
mod sync_once_cell;

pub use irq::{IrqGuard, IrqMutexGuard};
pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;
pub use sync_once_cell::SyncOnceCell;

/// Spin lock for short sections with little contention.
pub type SpinMutex<T> = Mutex<T, RawSpin>;

/// Fair lock for state every CPU contends on, such as the frame allocator.
pub type TicketMutex<T> = Mutex<T, RawTicket>;

/// A lock word without the data it protects.
///
/// # Safety
/// Between a successful [`lock`](Self::lock) or [`try_lock`](Self::try_lock)
/// and the matching [`unlock`](Self::unlock) no other caller may acquire the
/// lock, and acquisition must synchronize with the previous release.
pub unsafe trait RawLock {
    /// The unlocked state.
    const INIT: Self;

    fn lock(&self);

    fn try_lock(&self) -> bool;

    /// # Safety
    /// The caller must hold the lock.
    unsafe fn unlock(&self);

    fn is_locked(&self) -> bool;
}
