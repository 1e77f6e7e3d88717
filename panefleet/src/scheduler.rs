//! Periodic timers for the poll loop and the watchdog.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error};

use crate::sync::{CancelToken, lock};

/// A named thread calling a closure every `interval`.
///
/// Each tick is fenced: a panicking tick is logged and the timer keeps going.
/// The time of the last completed tick is observable so a supervisor can tell
/// a stalled timer from a live one.
#[derive(Debug)]
pub struct PollTimer {
    name: String,
    cancel: CancelToken,
    started_at: Instant,
    last_tick: Arc<Mutex<Option<Instant>>>,
    join: Option<JoinHandle<()>>,
}

impl PollTimer {
    pub fn start<F>(name: &str, interval: Duration, tick: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let cancel = CancelToken::new();
        let last_tick = Arc::new(Mutex::new(None));
        let join = {
            let cancel = cancel.clone();
            let last_tick = last_tick.clone();
            let label = name.to_string();
            thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    while !cancel.wait_timeout(interval) {
                        if catch_unwind(AssertUnwindSafe(&tick)).is_err() {
                            error!(timer = %label, "tick panicked");
                        }
                        *lock(&last_tick) = Some(Instant::now());
                    }
                    debug!(timer = %label, "timer stopped");
                })
                .with_context(|| format!("spawn {name} timer"))?
        };
        Ok(Self {
            name: name.to_string(),
            cancel,
            started_at: Instant::now(),
            last_tick,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// When the last tick completed; `None` before the first.
    pub fn last_tick(&self) -> Option<Instant> {
        *lock(&self.last_tick)
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Stop ticking without waiting for the thread.
    pub fn halt(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the thread to exit.
    pub fn stop(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            error!(timer = %self.name, "timer thread panicked");
        }
    }
}

impl Drop for PollTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn ticks_and_records_last_tick() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let timer = PollTimer::start("test-tick", Duration::from_millis(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("start");
        assert!(wait_for(|| count.load(Ordering::SeqCst) >= 3));
        assert!(timer.last_tick().is_some());
        assert!(timer.is_running());
        timer.stop();
    }

    #[test]
    fn panicking_tick_does_not_kill_timer() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let timer = PollTimer::start("test-panic", Duration::from_millis(1), move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first tick fails");
            }
        })
        .expect("start");
        assert!(wait_for(|| count.load(Ordering::SeqCst) >= 3));
        timer.stop();
    }

    #[test]
    fn halted_timer_stops_ticking() {
        let timer = PollTimer::start("test-halt", Duration::from_millis(1), || {}).expect("start");
        assert!(wait_for(|| timer.last_tick().is_some()));
        timer.halt();
        assert!(wait_for(|| !timer.is_running()));
        let last = timer.last_tick();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(timer.last_tick(), last);
    }
}
