use crate::RawLock;
use crate::backoff::spin_for;
use core::sync::atomic::{AtomicUsize, Ordering};

/// FIFO ticket lock: waiters are served in arrival order.
///
/// A waiter takes the next ticket and waits until `now_serving` reaches it,
/// pausing in proportion to how many tickets are still ahead of it.
#[derive(Debug, Default)]
pub struct RawTicket {
    next_ticket: AtomicUsize,
    now_serving: AtomicUsize,
}

impl RawTicket {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_ticket: AtomicUsize::new(0),
            now_serving: AtomicUsize::new(0),
        }
    }

    /// Tickets handed out but not yet served, the holder's included.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        let next = self.next_ticket.load(Ordering::Relaxed);
        next.wrapping_sub(self.now_serving.load(Ordering::Relaxed))
    }
}

unsafe impl RawLock for RawTicket {
    const INIT: Self = Self::new();

    fn lock(&self) {
        let mine = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        loop {
            let serving = self.now_serving.load(Ordering::Acquire);
            if serving == mine {
                return;
            }
            spin_for(mine.wrapping_sub(serving));
        }
    }

    fn try_lock(&self) -> bool {
        let serving = self.now_serving.load(Ordering::Relaxed);
        self.next_ticket
            .compare_exchange(serving, serving.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        debug_assert!(self.is_locked(), "unlock of a free RawTicket");
        // Only the holder advances `now_serving`.
        let served = self.now_serving.load(Ordering::Relaxed);
        self.now_serving.store(served.wrapping_add(1), Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.queue_len() != 0
    }
}
