use core::cell::UnsafeCell;
use core::fmt;
use core::hint::spin_loop;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

#[repr(u8)]
#[derive(Copy, Clone, Eq, PartialEq)]
enum State {
    Empty = 0,
    Writing = 1,
    Ready = 2,
}

impl State {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Empty,
            1 => Self::Writing,
            _ => Self::Ready,
        }
    }
}

/// A cell written at most once, then shared read-only.
///
/// Holds the memory-management singletons. Readers never block: until the
/// writer publishes, [`get`](Self::get) returns `None`. An initializer that
/// unwinds leaves the cell empty again.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    slot: UnsafeCell<MaybeUninit<T>>,
}

// Only the single writer touches `slot` before `Ready`; afterwards it is
// shared immutably.
unsafe impl<T: Send + Sync> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(State::Empty as u8),
            slot: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.state() == State::Ready
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        self.is_initialized().then(|| unsafe { self.value_unchecked() })
    }

    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        if *self.state.get_mut() == State::Ready as u8 {
            Some(unsafe { self.slot.get_mut().assume_init_mut() })
        } else {
            None
        }
    }

    /// Store `value` unless the cell is already set or being set.
    ///
    /// # Errors
    /// Hands `value` back if another writer got there first.
    pub fn set(&self, value: T) -> Result<&T, T> {
        match self.claim() {
            Some(writer) => Ok(writer.publish(value)),
            None => Err(value),
        }
    }

    /// The stored value, running `init` first if the cell is empty.
    ///
    /// A caller that loses the race spins until the winner has published,
    /// or takes over if the winner's initializer unwound.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        loop {
            if let Some(value) = self.get() {
                return value;
            }
            if let Some(writer) = self.claim() {
                return writer.publish(init());
            }
            spin_loop();
        }
    }

    /// Spin until a value is published.
    pub fn wait(&self) -> &T {
        loop {
            if let Some(value) = self.get() {
                return value;
            }
            spin_loop();
        }
    }

    pub fn into_inner(mut self) -> Option<T> {
        if *self.state.get_mut() != State::Ready as u8 {
            return None;
        }
        *self.state.get_mut() = State::Empty as u8;
        Some(unsafe { self.slot.get_mut().assume_init_read() })
    }

    fn claim(&self) -> Option<Writer<'_, T>> {
        self.state
            .compare_exchange(
                State::Empty as u8,
                State::Writing as u8,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
            .then_some(Writer { cell: self })
    }

    /// # Safety
    /// The state must be `Ready`.
    unsafe fn value_unchecked(&self) -> &T {
        unsafe { (*self.slot.get()).assume_init_ref() }
    }
}

/// Exclusive right to fill the cell. Dropping it unpublished (an unwinding
/// initializer) returns the cell to `Empty`.
struct Writer<'a, T> {
    cell: &'a SyncOnceCell<T>,
}

impl<'a, T> Writer<'a, T> {
    fn publish(self, value: T) -> &'a T {
        let cell = self.cell;
        core::mem::forget(self);
        unsafe { (*cell.slot.get()).write(value) };
        cell.state.store(State::Ready as u8, Ordering::Release);
        unsafe { cell.value_unchecked() }
    }
}

impl<T> Drop for Writer<'_, T> {
    fn drop(&mut self) {
        self.cell.state.store(State::Empty as u8, Ordering::Release);
    }
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for SyncOnceCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("SyncOnceCell").field(value).finish(),
            None => f.write_str("SyncOnceCell(<empty>)"),
        }
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == State::Ready as u8 {
            unsafe { self.slot.get_mut().assume_init_drop() }
        }
    }
}
