//! Periodic health checks over the loop engine.
//!
//! Every tick runs its checks independently: one failing (or panicking)
//! never keeps the others from running.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::io::config::WatchdogSettings;
use crate::provider::{SubjectProbe, SubjectStatus};
use crate::scheduler::PollTimer;
use crate::supervisor::{Notice, NoticeKind, Supervisor, TrackKind};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchdogReport {
    /// Tasks whose worker was found dead while marked running.
    pub dead_workers: Vec<String>,
    pub timer_restarted: bool,
    /// `(task, window)` tracking entries dropped as stale.
    pub stale_cleaned: Vec<(String, String)>,
    /// Checks that failed or panicked this tick.
    pub failed_checks: Vec<&'static str>,
}

pub struct Watchdog {
    supervisor: Arc<Supervisor>,
    probe: Arc<dyn SubjectProbe>,
    settings: WatchdogSettings,
}

impl Watchdog {
    pub fn new(supervisor: Arc<Supervisor>, probe: Arc<dyn SubjectProbe>) -> Self {
        let settings = supervisor.settings().watchdog.clone();
        Self {
            supervisor,
            probe,
            settings,
        }
    }

    pub fn tick(&self) -> WatchdogReport {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&self, now: Instant) -> WatchdogReport {
        let mut report = WatchdogReport::default();
        self.supervisor.drain_events();

        report.dead_workers = fenced("dead-workers", &mut report.failed_checks, || {
            Ok(self.supervisor.reap_dead_workers())
        });
        report.timer_restarted = fenced("poll-timer", &mut report.failed_checks, || self.check_poll_timer(now));
        report.stale_cleaned = fenced("tracking", &mut report.failed_checks, || self.audit_tracking());

        if report != WatchdogReport::default() {
            info!(
                dead = report.dead_workers.len(),
                timer_restarted = report.timer_restarted,
                cleaned = report.stale_cleaned.len(),
                failed = report.failed_checks.len(),
                "watchdog tick"
            );
        } else {
            debug!("watchdog tick, all healthy");
        }
        report
    }

    /// Restart the poll timer when loops are active and it has stopped ticking.
    fn check_poll_timer(&self, now: Instant) -> Result<bool> {
        let active = self.supervisor.any_loop_running()
            || !self.supervisor.tracked(TrackKind::Pending).is_empty();
        if !active {
            return Ok(false);
        }
        let stale_after = Duration::from_millis(self.settings.poll_stale_ms);
        let stale = match self.supervisor.poll_timer_status() {
            None => true,
            Some(status) if !status.running => true,
            // A timer that has not ticked yet gets the same grace from its start.
            Some(status) => {
                let reference = status.last_tick.unwrap_or(status.started_at);
                now.saturating_duration_since(reference) > stale_after
            }
        };
        if !stale {
            return Ok(false);
        }
        warn!(stale_ms = self.settings.poll_stale_ms, "poll timer stale, restarting");
        self.supervisor.restart_poll_timer()?;
        self.supervisor.push_notice(Notice::global(
            NoticeKind::PollTimerRestarted,
            "poll timer stopped ticking and was restarted",
        ));
        Ok(true)
    }

    /// Drop tracking entries whose task is gone, finished, or whose window closed.
    fn audit_tracking(&self) -> Result<Vec<(String, String)>> {
        let mut cleaned = Vec::new();
        for kind in [TrackKind::Pending, TrackKind::Awaiting] {
            for (task_id, window) in self.supervisor.tracked(kind) {
                let stale = match self.probe.status(&task_id) {
                    SubjectStatus::Missing | SubjectStatus::Terminal => true,
                    SubjectStatus::Active => !self.probe.window_exists(&task_id, &window),
                };
                if stale && self.supervisor.untrack(kind, &task_id) {
                    info!(%task_id, %window, ?kind, "dropped stale tracking entry");
                    self.supervisor.push_notice(Notice {
                        task_id: Some(task_id.clone()),
                        kind: NoticeKind::TrackingCleaned,
                        message: format!("stopped tracking {window}"),
                    });
                    cleaned.push((task_id, window));
                }
            }
        }
        Ok(cleaned)
    }

    /// Run [`Watchdog::tick`] every configured interval.
    pub fn start(self: &Arc<Self>) -> Result<PollTimer> {
        let weak = Arc::downgrade(self);
        PollTimer::start(
            "panefleet-watchdog",
            Duration::from_secs(self.settings.interval_secs),
            move || {
                if let Some(watchdog) = weak.upgrade() {
                    watchdog.tick();
                }
            },
        )
    }
}

fn fenced<T: Default>(name: &'static str, failed: &mut Vec<&'static str>, check: impl FnOnce() -> Result<T>) -> T {
    match catch_unwind(AssertUnwindSafe(check)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            error!(check = name, err = %format!("{err:#}"), "watchdog check failed");
            failed.push(name);
            T::default()
        }
        Err(_) => {
            error!(check = name, "watchdog check panicked");
            failed.push(name);
            T::default()
        }
    }
}
