// ABOUTME: Two-tier lock guarding the encoder against teardown
// ABOUTME: Non-blocking low-priority acquisition and a waiting high-priority acquisition

use parking_lot::{Mutex, MutexGuard};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

/// Yields before the high-priority wait starts sleeping
const SPIN_YIELDS: u32 = 64;

/// Sleep between checks once yielding was not enough
const WAIT_SLEEP: Duration = Duration::from_micros(500);

/// Lock with a frequent low-priority side and a rare high-priority side.
///
/// The state word is 0 when free, 1 while the low-priority side holds the
/// lock, and at least 2 once a high-priority request is pending or held.
/// The low side never waits: [`SlimLock::try_lock_low`] either takes a free
/// lock or gives up. The high side announces itself, which makes every later
/// low attempt fail, and then waits for the current low holder to leave.
pub struct SlimLock<T> {
    state: AtomicU32,
    high: Mutex<()>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only handed out through guards; a low guard
// exists only after the 0 -> 1 transition, a high guard only while holding
// `high` and after the low bit has cleared with the high bits set.
unsafe impl<T: Send> Send for SlimLock<T> {}
unsafe impl<T: Send> Sync for SlimLock<T> {}

impl<T> SlimLock<T> {
    /// Create an unlocked lock around `data`
    pub fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            high: Mutex::new(()),
            data: UnsafeCell::new(data),
        }
    }

    /// Low-priority acquisition. Succeeds only if the lock is completely free.
    pub fn try_lock_low(&self) -> Option<LowGuard<'_, T>> {
        self.state
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;
        Some(LowGuard { lock: self })
    }

    /// High-priority acquisition.
    ///
    /// Blocks low-priority attempts immediately, then waits until any
    /// in-progress low-priority holder releases.
    pub fn lock_high(&self) -> HighGuard<'_, T> {
        let exclusive = self.high.lock();
        self.state.fetch_add(2, Ordering::AcqRel);

        let mut waits = 0u32;
        while self.state.load(Ordering::Acquire) & 1 != 0 {
            if waits < SPIN_YIELDS {
                thread::yield_now();
            } else {
                thread::sleep(WAIT_SLEEP);
            }
            waits = waits.saturating_add(1);
        }

        HighGuard {
            lock: self,
            _exclusive: exclusive,
        }
    }

    /// Raw state word
    pub fn raw_state(&self) -> u32 {
        self.state.load(Ordering::Relaxed)
    }

    /// Consume the lock, returning the data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SlimLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Low-priority guard. Dropping it releases one unit of the state word.
pub struct LowGuard<'a, T> {
    lock: &'a SlimLock<T>,
}

impl<T> Deref for LowGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: see the impl Sync comment on SlimLock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for LowGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see the impl Sync comment on SlimLock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for LowGuard<'_, T> {
    fn drop(&mut self) {
        // Leaves any pending high-priority bits in place
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

/// High-priority guard. Dropping it resets the lock to free.
pub struct HighGuard<'a, T> {
    lock: &'a SlimLock<T>,
    _exclusive: MutexGuard<'a, ()>,
}

impl<T> Deref for HighGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: see the impl Sync comment on SlimLock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for HighGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see the impl Sync comment on SlimLock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for HighGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_low_is_exclusive() {
        let lock = SlimLock::new(0u32);

        let mut guard = lock.try_lock_low().unwrap();
        *guard += 1;
        assert_eq!(lock.raw_state(), 1);
        assert!(lock.try_lock_low().is_none());

        drop(guard);
        assert_eq!(lock.raw_state(), 0);
        assert_eq!(*lock.try_lock_low().unwrap(), 1);
    }

    #[test]
    fn test_low_fails_while_high_held() {
        let lock = SlimLock::new(());

        let guard = lock.lock_high();
        assert!(lock.raw_state() >= 2);
        assert!(lock.try_lock_low().is_none());

        drop(guard);
        assert_eq!(lock.raw_state(), 0);
        assert!(lock.try_lock_low().is_some());
    }

    #[test]
    fn test_high_waits_for_low_holder() {
        let lock = Arc::new(SlimLock::new(Vec::<&'static str>::new()));
        let low_entered = Arc::new(AtomicBool::new(false));

        let holder = {
            let lock = Arc::clone(&lock);
            let low_entered = Arc::clone(&low_entered);
            thread::spawn(move || {
                let mut guard = lock.try_lock_low().unwrap();
                low_entered.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                guard.push("low");
            })
        };

        while !low_entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        let started = Instant::now();
        let mut guard = lock.lock_high();
        assert!(started.elapsed() >= Duration::from_millis(20));
        guard.push("high");
        drop(guard);

        holder.join().unwrap();
        assert_eq!(*lock.try_lock_low().unwrap(), vec!["low", "high"]);
    }

    #[test]
    fn test_pending_high_blocks_new_low() {
        let lock = Arc::new(SlimLock::new(()));
        let low = lock.try_lock_low().unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let _guard = lock.lock_high();
            })
        };

        while lock.raw_state() < 2 {
            thread::yield_now();
        }
        assert_eq!(lock.raw_state(), 3);

        drop(low);
        waiter.join().unwrap();
        assert_eq!(lock.raw_state(), 0);
        assert!(lock.try_lock_low().is_some());
    }
}
