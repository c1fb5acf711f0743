// Sync primitives that switch between std and loom based on feature flag

#[cfg(not(feature = "loom"))]
pub(crate) use std::sync::Arc;
#[cfg(not(feature = "loom"))]
pub(crate) use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "loom")]
pub(crate) use loom::sync::Arc;
#[cfg(feature = "loom")]
pub(crate) use loom::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "loom")]
pub(crate) use loom::cell::UnsafeCell;

use crate::util::Backoff;

// Helper for spin loop hints
#[cfg(not(feature = "loom"))]
#[inline]
pub(crate) fn spin_loop() {
    std::hint::spin_loop();
}

#[cfg(feature = "loom")]
#[inline]
pub(crate) fn spin_loop() {
    loom::thread::yield_now();
}

/// `std` counterpart of `loom::cell::UnsafeCell`, exposing the same
/// closure-based access so callers compile unchanged under both.
#[cfg(not(feature = "loom"))]
#[derive(Debug)]
pub(crate) struct UnsafeCell<T>(std::cell::UnsafeCell<T>);

#[cfg(not(feature = "loom"))]
impl<T> UnsafeCell<T> {
    pub(crate) fn new(data: T) -> Self {
        Self(std::cell::UnsafeCell::new(data))
    }

    #[inline]
    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(*mut T) -> R) -> R {
        f(self.0.get())
    }
}

/// Spin lock guarding the cache index.
///
/// Acquisition never parks the thread: contended waiters spin with bounded
/// exponential backoff until the holder releases. Critical sections are
/// expressed as closures so the lock can never be held across a return to the
/// caller.
pub(crate) struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `locked`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub(crate) fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Run `f` with exclusive access to the protected data.
    #[inline]
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _guard = self.acquire();
        // SAFETY: the guard gives us exclusive ownership until it is dropped,
        // which happens after `f` returns (or unwinds).
        self.data.with_mut(|ptr| f(unsafe { &mut *ptr }))
    }

    fn acquire(&self) -> SpinGuard<'_> {
        let mut backoff = Backoff::new();

        // Test-and-test-and-set: only attempt the CAS once the lock looks free
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }

        SpinGuard {
            locked: &self.locked,
        }
    }
}

/// Releases the lock on drop, including when the critical section panics.
struct SpinGuard<'a> {
    locked: &'a AtomicBool,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.locked.store(false, Ordering::Release);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_spin_lock_serializes_increments() {
        let lock = Arc::new(SpinLock::new(0u64));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        lock.with(|count| *count += 1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(lock.with(|count| *count), 40_000);
    }

    #[test]
    fn test_spin_lock_released_after_panic() {
        let lock = SpinLock::new(Vec::<u32>::new());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            lock.with(|data| {
                data.push(1);
                if data.len() == 1 {
                    panic!("critical section failed");
                }
            });
        }));
        assert!(result.is_err());

        // Lock must be usable again
        lock.with(|data| data.push(7));
        assert_eq!(lock.with(|data| data.clone()), vec![1, 7]);
    }
}
