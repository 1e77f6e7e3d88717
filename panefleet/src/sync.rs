//! Small synchronization helpers shared by the background workers.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Watchdog checks run under `catch_unwind`; a panicking check must not leave
/// every later tick unable to read shared state.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cooperative cancellation flag with a wakeable wait.
///
/// Clones share the same flag. Waiting threads wake as soon as
/// [`CancelToken::cancel`] is called.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *lock(flag) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Block for up to `timeout`. Returns true if cancelled (before or during).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = lock(flag);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = match cvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_times_out_without_cancel() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(5)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_wakes_waiter_early() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().expect("join"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
