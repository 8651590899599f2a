use crate::RawLock;
use crate::backoff::Backoff;
use core::sync::atomic::{AtomicBool, Ordering};

/// Test-and-test-and-set lock.
///
/// A waiter reads the flag until it looks free and only then attempts the
/// exchange, backing off exponentially after every lost race.
#[derive(Debug, Default)]
pub struct RawSpin {
    locked: AtomicBool,
}

impl RawSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    fn acquire(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

unsafe impl RawLock for RawSpin {
    const INIT: Self = Self::new();

    fn lock(&self) {
        let mut backoff = Backoff::new();
        loop {
            if self.acquire() {
                return;
            }
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
    }

    fn try_lock(&self) -> bool {
        // A strong exchange: a spurious failure would report contention that
        // does not exist.
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlock of a free RawSpin");
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}
