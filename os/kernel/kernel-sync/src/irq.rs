//! Interrupt-masking critical sections.
//!
//! On bare metal (`target_os = "none"`) the guard reads `RFLAGS.IF` and uses
//! `cli`/`sti`. On hosted targets (unit and integration tests) the interrupt
//! flag is emulated per thread, so nesting and restore semantics can be
//! asserted without privileged instructions.

use crate::{Mutex, MutexGuard, RawLock};
use core::ops::{Deref, DerefMut};

#[cfg(target_os = "none")]
mod hw {
    const RFLAGS_IF: u64 = 1 << 9;

    #[inline]
    pub fn enabled() -> bool {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(preserves_flags)) }
        r & RFLAGS_IF != 0
    }

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nostack)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nostack)) }
    }
}

#[cfg(not(target_os = "none"))]
mod hw {
    use core::cell::Cell;

    std::thread_local! {
        static IF: Cell<bool> = const { Cell::new(true) };
    }

    pub fn enabled() -> bool {
        IF.with(Cell::get)
    }

    pub fn disable() {
        IF.with(|f| f.set(false));
    }

    pub fn enable() {
        IF.with(|f| f.set(true));
    }
}

/// Whether interrupts are currently enabled on this CPU.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    hw::enabled()
}

/// Run `f` with interrupts masked, restoring the previous state afterwards.
#[inline]
pub fn without_interrupts<U>(f: impl FnOnce() -> U) -> U {
    let _g = IrqGuard::new();
    f()
}

/// RAII critical section: masks interrupts on creation, restores on drop.
///
/// Only re-enables if interrupts were enabled when the guard was created, so
/// guards nest correctly.
#[must_use = "interrupts are restored as soon as the guard is dropped"]
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    pub fn new() -> Self {
        let were_enabled = hw::enabled();
        if were_enabled {
            hw::disable();
        }
        Self { were_enabled }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            hw::enable();
        }
    }
}

/// Guard returned by [`Mutex::lock_irq`].
///
/// Field order matters: the mutex guard drops first, so the lock is released
/// while interrupts are still masked.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct IrqMutexGuard<'a, T, R: RawLock> {
    guard: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock> Deref for IrqMutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, R: RawLock> DerefMut for IrqMutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, R: RawLock> Mutex<T, R> {
    /// Acquire the mutex with interrupts masked for the guard's lifetime.
    ///
    /// Required for every lock that a fault or interrupt handler may also
    /// take; otherwise the handler can spin forever on a lock held by the
    /// code it interrupted.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutexGuard<'_, T, R> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqMutexGuard { guard, _irq: irq }
    }

    /// Closure form of [`lock_irq`](Self::lock_irq).
    #[inline]
    pub fn with_lock_irq<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut g = self.lock_irq();
        f(&mut g)
    }
}
