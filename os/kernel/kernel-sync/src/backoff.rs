use core::hint::spin_loop;

/// Bounded exponential backoff for contended spin loops.
///
/// Each [`spin`](Self::spin) pauses twice as long as the previous one until
/// `1 << MAX_SHIFT` pause instructions, after which it stays there.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    shift: u32,
}

impl Backoff {
    const MAX_SHIFT: u32 = 6;

    pub(crate) const fn new() -> Self {
        Self { shift: 0 }
    }

    #[inline]
    pub(crate) fn spin(&mut self) {
        for _ in 0..1_u32 << self.shift {
            spin_loop();
        }
        if self.shift < Self::MAX_SHIFT {
            self.shift += 1;
        }
    }
}

/// Pause roughly in proportion to `distance`, the number of waiters ahead.
#[inline]
pub(crate) fn spin_for(distance: usize) {
    const PAUSES_PER_WAITER: usize = 16;
    for _ in 0..distance.saturating_mul(PAUSES_PER_WAITER) {
        spin_loop();
    }
}
