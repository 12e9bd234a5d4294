//! Waitable event and scoped mutual exclusion shared by the service state
//! machine and worker threads.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled,
    TimedOut,
    Failed,
}

/// A waitable flag, initially unset.
///
/// A manual event stays signaled until [`Event::reset`] is called and releases
/// every waiter. An auto event releases exactly one waiter per [`Event::set`]
/// and clears itself when that waiter wakes.
pub struct Event {
    manual: bool,
    signaled: std::sync::Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new(manual: bool) -> Self {
        Event {
            manual,
            signaled: std::sync::Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Blocks until the event is signaled or `timeout` elapses. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        let Ok(mut signaled) = self.signaled.lock() else {
            return WaitResult::Failed;
        };

        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        while !*signaled {
            signaled = match deadline {
                None => match self.cond.wait(signaled) {
                    Ok(guard) => guard,
                    Err(_) => return WaitResult::Failed,
                },
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        return WaitResult::TimedOut;
                    }

                    match self.cond.wait_timeout(signaled, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(_) => return WaitResult::Failed,
                    }
                }
            };
        }

        if !self.manual {
            *signaled = false;
        }

        WaitResult::Signaled
    }

    pub fn set(&self) {
        let Ok(mut signaled) = self.signaled.lock() else {
            tracing::error!("event lock poisoned, cannot signal");
            return;
        };

        *signaled = true;
        if self.manual {
            self.cond.notify_all();
        } else {
            self.cond.notify_one();
        }
    }

    pub fn reset(&self) {
        if let Ok(mut signaled) = self.signaled.lock() {
            *signaled = false;
        }
    }

    pub fn is_set(&self) -> bool {
        self.signaled.lock().map(|v| *v).unwrap_or(false)
    }
}

/// Unnamed mutual exclusion around a value. Acquisition hands out a
/// [`ScopedLock`] which releases on every exit path when dropped.
pub struct Mutex<T> {
    inner: std::sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            inner: std::sync::Mutex::new(value),
        }
    }

    /// Blocking acquire. A panic in a previous holder does not make the value
    /// unreachable; the lock is recovered.
    pub fn wait(&self) -> ScopedLock<'_, T> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("mutex was poisoned by a panicking holder, recovering");
                poisoned.into_inner()
            }
        };

        ScopedLock { guard }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ScopedLock<'_, T>> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Some(ScopedLock { guard }),
                Err(TryLockError::Poisoned(poisoned)) => {
                    return Some(ScopedLock {
                        guard: poisoned.into_inner(),
                    });
                }
                Err(TryLockError::WouldBlock) => {}
            }

            if deadline <= Instant::now() {
                return None;
            }

            std::thread::sleep(LOCK_RETRY_INTERVAL);
        }
    }

    pub fn into_inner(self) -> T {
        match self.inner.into_inner() {
            Ok(value) => value,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

pub struct ScopedLock<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> ScopedLock<'_, T> {
    /// Releases ahead of scope end.
    pub fn release(self) {}
}

impl<T> Deref for ScopedLock<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ScopedLock<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::{Event, Mutex, WaitResult};

    #[test]
    fn wait_times_out_when_not_set() {
        let event = Event::new(true);
        assert_eq!(event.wait(Some(Duration::from_millis(20))), WaitResult::TimedOut);
    }

    #[test]
    fn manual_event_stays_signaled() {
        let event = Event::new(true);
        event.set();

        assert_eq!(event.wait(Some(Duration::ZERO)), WaitResult::Signaled);
        assert_eq!(event.wait(Some(Duration::ZERO)), WaitResult::Signaled);

        event.reset();
        assert_eq!(event.wait(Some(Duration::from_millis(5))), WaitResult::TimedOut);
    }

    #[test]
    fn auto_event_releases_single_waiter() {
        let event = Arc::new(Event::new(false));
        let released = Arc::new(AtomicUsize::new(0));

        let waiters = (0..2)
            .map(|_| {
                let event = event.clone();
                let released = released.clone();
                std::thread::spawn(move || {
                    if event.wait(Some(Duration::from_millis(300))) == WaitResult::Signaled {
                        released.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();

        std::thread::sleep(Duration::from_millis(50));
        event.set();

        for waiter in waiters {
            waiter.join().unwrap();
        }

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!event.is_set());
    }

    #[test]
    fn set_wakes_blocked_waiter() {
        let event = Arc::new(Event::new(true));

        let waiter = {
            let event = event.clone();
            std::thread::spawn(move || event.wait(None))
        };

        std::thread::sleep(Duration::from_millis(20));
        event.set();

        assert_eq!(waiter.join().unwrap(), WaitResult::Signaled);
    }

    #[test]
    fn scoped_lock_releases_on_early_return() {
        let mutex = Mutex::new(0u32);

        fn bump(mutex: &Mutex<u32>, bail: bool) -> Result<(), ()> {
            let mut value = mutex.wait();
            *value += 1;
            if bail {
                return Err(());
            }
            *value += 1;
            Ok(())
        }

        assert!(bump(&mutex, true).is_err());
        assert!(bump(&mutex, false).is_ok());

        let value = mutex.wait_timeout(Duration::from_millis(10)).expect("lock leaked");
        assert_eq!(*value, 3);
    }

    #[test]
    fn wait_timeout_gives_up_while_held() {
        let mutex = Arc::new(Mutex::new(()));
        let held = mutex.wait();

        let other = mutex.clone();
        let attempt = std::thread::spawn(move || other.wait_timeout(Duration::from_millis(20)).is_some());
        assert!(!attempt.join().unwrap());

        held.release();
        assert!(mutex.wait_timeout(Duration::from_millis(20)).is_some());
    }
}
