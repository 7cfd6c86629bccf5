//! The cross-thread wait primitive (§4.5).
//!
//! The reference implementation opens a fresh anonymous pipe per waiting
//! thread and blocks on `select()`, because CPython otherwise has no way to
//! interrupt a single-threaded polling loop from another thread without
//! busy-waiting. Rust's `std::sync::Condvar` gives the identical
//! happens-before guarantee — the state changes while the lock backing the
//! condvar is held, and `notify_all` is called before the lock is released,
//! so a waiter that is already asleep on the condvar is woken, and a waiter
//! that hasn't yet started waiting will see the new state on its next check
//! — without needing a pipe, a `select()` loop, or per-waiter file
//! descriptors. `WaiterGuard` tracks how many threads are currently parked
//! in signal mode, the Rust-native counterpart to the reference
//! implementation's `_state_transition_pipes` set, so tests can assert the
//! registry never leaks an entry past the `wait` call that created it.

use std::sync::atomic::{AtomicUsize, Ordering};

/// RAII registration for one in-progress signal-mode `wait` call. Created on
/// entry, dropped on every exit path (normal return, timeout loop exit, or
/// unwinding through a panic), so the count it decrements never leaks.
pub(crate) struct WaiterGuard<'a> {
    count: &'a AtomicUsize,
}

impl<'a> WaiterGuard<'a> {
    pub fn register(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        WaiterGuard { count }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_increments_and_decrements() {
        let count = AtomicUsize::new(0);
        {
            let _guard = WaiterGuard::register(&count);
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn guard_releases_even_on_unwind() {
        let count = AtomicUsize::new(0);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = WaiterGuard::register(&count);
            panic!("simulated listener panic");
        }));
        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
