//! Host side of the loop engine.
//!
//! [`Supervisor`] starts loop workers, keeps a read-only view of each one
//! built from the snapshots they publish, and turns state changes into
//! one-shot [`Notice`]s for the UI. It also owns the short poll timer and the
//! tracking sets the watchdog audits:
//!
//! - *pending*: tasks whose agent pane is watched for going idle;
//! - *awaiting*: tasks whose agent is waiting for a human.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use tracing::{debug, error, info, instrument, warn};

use crate::breadcrumb::{LoopCrumb, consume_breadcrumb, save_breadcrumb};
use crate::idle::{Clock, PaneIdleTracker, SystemClock};
use crate::io::config::Settings;
use crate::io::store::StateStore;
use crate::io::tmux::Multiplexer;
use crate::looping::{ERROR, LoopConfig, LoopEvent, LoopEventKind, LoopHandle, LoopKind, LoopRunner, LoopState};
use crate::provider::{LaunchMode, PaneProvider, SubjectProbe, SubjectStatus};
use crate::scheduler::PollTimer;
use crate::sync::lock;

/// Task id of the singleton watcher loop.
pub const WATCHER_TASK: &str = "watcher";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    LoopFinished,
    InputRequired,
    PaneIdle,
    WorkerDied,
    PollTimerRestarted,
    TrackingCleaned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub task_id: Option<String>,
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    fn task(task_id: &str, kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn global(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            task_id: None,
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Pending,
    Awaiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// A worker was started and continues from the saved iteration.
    Resumed,
    /// The task is finished; its state was kept without a worker.
    Restored,
    /// The task no longer exists.
    Dropped,
    /// The worker could not be started; the error was logged.
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct TimerStatus {
    pub started_at: Instant,
    pub last_tick: Option<Instant>,
    pub running: bool,
}

struct LoopEntry {
    view: LoopState,
    config: LoopConfig,
    handle: Option<LoopHandle>,
}

impl LoopEntry {
    /// Replace the view with a worker snapshot, keeping host-owned flags.
    fn apply(&mut self, event: LoopEvent) {
        if event.snapshot.loop_id != self.view.loop_id {
            debug!(task = %event.snapshot.task_id, "event from a previous loop, ignoring");
            return;
        }
        let notified_done = self.view.ui_notified_done;
        let notified_input = self.view.ui_notified_input;
        let stop_requested = self.view.stop_requested;
        self.view = event.snapshot;
        self.view.ui_notified_done = notified_done;
        self.view.ui_notified_input = event.kind != LoopEventKind::AwaitingHuman && notified_input;
        self.view.stop_requested |= stop_requested;
    }

    fn worker_dead(&self) -> bool {
        self.view.running && self.handle.as_ref().is_none_or(LoopHandle::is_finished)
    }

    fn collect_notices(&mut self, out: &mut Vec<Notice>) {
        let view = &mut self.view;
        if view.awaiting_human && !view.ui_notified_input {
            view.ui_notified_input = true;
            out.push(Notice::task(&view.task_id, NoticeKind::InputRequired, "agent is waiting for input"));
        }
        if !view.running && !view.ui_notified_done {
            view.ui_notified_done = true;
            let verdict = view.latest_verdict.as_deref().unwrap_or("no verdict");
            out.push(Notice::task(
                &view.task_id,
                NoticeKind::LoopFinished,
                format!("{} loop finished after {} iterations: {verdict}", view.kind.as_str(), view.iteration),
            ));
        }
    }
}

pub struct Supervisor {
    mux: Arc<dyn Multiplexer>,
    provider: Arc<dyn PaneProvider>,
    store: Arc<dyn StateStore>,
    settings: Settings,
    loops: Mutex<BTreeMap<String, LoopEntry>>,
    watcher: Mutex<Option<LoopEntry>>,
    events_tx: Sender<LoopEvent>,
    events_rx: Mutex<Receiver<LoopEvent>>,
    pending: Mutex<BTreeMap<String, String>>,
    awaiting: Mutex<BTreeMap<String, String>>,
    idle: PaneIdleTracker,
    notices: Mutex<Vec<Notice>>,
    timer: Mutex<Option<PollTimer>>,
}

impl Supervisor {
    pub fn new(
        mux: Arc<dyn Multiplexer>,
        provider: Arc<dyn PaneProvider>,
        store: Arc<dyn StateStore>,
        settings: Settings,
    ) -> Self {
        Self::with_clock(mux, provider, store, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        mux: Arc<dyn Multiplexer>,
        provider: Arc<dyn PaneProvider>,
        store: Arc<dyn StateStore>,
        settings: Settings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let idle = PaneIdleTracker::with_clock(mux.clone(), clock, settings.idle_threshold());
        Self {
            mux,
            provider,
            store,
            settings,
            loops: Mutex::new(BTreeMap::new()),
            watcher: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(events_rx),
            pending: Mutex::new(BTreeMap::new()),
            awaiting: Mutex::new(BTreeMap::new()),
            idle,
            notices: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn idle_tracker(&self) -> &PaneIdleTracker {
        &self.idle
    }

    pub fn start_review(&self, task_id: &str, stop_on_soft: bool) -> Result<String> {
        let mut state = LoopState::new(task_id, LoopKind::Review);
        state.stop_on_soft = stop_on_soft;
        self.start_loop(state, LoopConfig::review(&self.settings), None)
    }

    pub fn start_monitor(&self, task_id: &str) -> Result<String> {
        let state = LoopState::new(task_id, LoopKind::Monitor);
        self.start_loop(state, LoopConfig::monitor(&self.settings), None)
    }

    pub fn start_watcher(&self) -> Result<String> {
        let state = LoopState::new(WATCHER_TASK, LoopKind::Watcher);
        self.start_loop(state, LoopConfig::watcher(&self.settings), None)
    }

    /// Start a worker for `state`. At most one loop runs per task, and at most
    /// one monitor and one watcher run overall.
    #[instrument(skip_all, fields(task = %state.task_id, kind = config.kind.as_str()))]
    pub fn start_loop(
        &self,
        mut state: LoopState,
        config: LoopConfig,
        first_mode: Option<LaunchMode>,
    ) -> Result<String> {
        let task_id = state.task_id.clone();
        let loop_id = state.loop_id.clone();
        let spawn = |state: &LoopState, config: &LoopConfig| -> Result<LoopHandle> {
            let mut runner = LoopRunner::new(
                config.clone(),
                state.clone(),
                self.provider.clone(),
                self.mux.clone(),
                self.events_tx.clone(),
            );
            if let Some(mode) = first_mode {
                runner = runner.with_first_mode(mode);
            }
            runner.spawn()
        };
        state.running = true;
        state.ui_notified_done = false;
        state.ui_notified_input = false;

        if config.kind == LoopKind::Watcher {
            let mut watcher = lock(&self.watcher);
            if watcher.as_ref().is_some_and(|w| w.view.running) {
                bail!("watcher loop is already running");
            }
            let handle = spawn(&state, &config)?;
            *watcher = Some(LoopEntry {
                view: state,
                config,
                handle: Some(handle),
            });
        } else {
            let mut loops = lock(&self.loops);
            if loops.get(&task_id).is_some_and(|e| e.view.running) {
                bail!("a loop is already running for {task_id}");
            }
            if config.kind == LoopKind::Monitor
                && let Some(other) = loops
                    .values()
                    .find(|e| e.view.running && e.view.kind == LoopKind::Monitor)
            {
                bail!("monitor loop already running for {}", other.view.task_id);
            }
            let handle = spawn(&state, &config)?;
            loops.insert(
                task_id.clone(),
                LoopEntry {
                    view: state,
                    config,
                    handle: Some(handle),
                },
            );
        }
        info!(%loop_id, "loop worker started");
        Ok(loop_id)
    }

    /// Ask a loop to stop. Returns false when no such loop is running.
    pub fn request_stop(&self, task_id: &str) -> bool {
        let stop = |entry: &mut LoopEntry| {
            entry.view.stop_requested = true;
            if let Some(handle) = &entry.handle {
                handle.request_stop();
            }
            entry.view.running
        };
        if task_id == WATCHER_TASK
            && let Some(entry) = lock(&self.watcher).as_mut()
        {
            return stop(entry);
        }
        lock(&self.loops).get_mut(task_id).is_some_and(stop)
    }

    pub fn snapshot(&self, task_id: &str) -> Option<LoopState> {
        if task_id == WATCHER_TASK {
            return lock(&self.watcher).as_ref().map(|e| e.view.clone());
        }
        lock(&self.loops).get(task_id).map(|e| e.view.clone())
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.snapshot(task_id).is_some_and(|s| s.running)
    }

    pub fn any_loop_running(&self) -> bool {
        lock(&self.loops).values().any(|e| e.view.running)
            || lock(&self.watcher).as_ref().is_some_and(|e| e.view.running)
    }

    /// Apply queued worker snapshots to the views. Returns how many were applied.
    pub fn drain_events(&self) -> usize {
        let events: Vec<LoopEvent> = lock(&self.events_rx).try_iter().collect();
        let count = events.len();
        for event in events {
            let task_id = event.snapshot.task_id.clone();
            match (event.kind, event.snapshot.awaiting_human, event.snapshot.window.clone()) {
                (LoopEventKind::AwaitingHuman, _, Some(window)) => {
                    lock(&self.awaiting).insert(task_id.clone(), window);
                }
                (LoopEventKind::Iteration | LoopEventKind::Finished, false, _) => {
                    lock(&self.awaiting).remove(&task_id);
                }
                _ => {}
            }
            if event.snapshot.kind == LoopKind::Watcher {
                if let Some(entry) = lock(&self.watcher).as_mut() {
                    entry.apply(event);
                }
            } else if let Some(entry) = lock(&self.loops).get_mut(&task_id) {
                entry.apply(event);
            }
        }
        count
    }

    /// One foreground tick: apply worker snapshots, raise one-shot notices,
    /// and poll pending panes for idleness.
    pub fn poll_tick(&self) -> Vec<Notice> {
        self.drain_events();
        let mut fresh = Vec::new();
        for entry in lock(&self.loops).values_mut() {
            entry.collect_notices(&mut fresh);
        }
        if let Some(entry) = lock(&self.watcher).as_mut() {
            entry.collect_notices(&mut fresh);
        }

        let pending: Vec<String> = lock(&self.pending).keys().cloned().collect();
        for task_id in pending {
            self.idle.poll(&task_id);
            if self.idle.became_idle(&task_id) {
                fresh.push(Notice::task(&task_id, NoticeKind::PaneIdle, "agent pane went idle"));
            }
        }

        if !fresh.is_empty() {
            debug!(count = fresh.len(), "new notices");
            lock(&self.notices).extend(fresh.iter().cloned());
        }
        fresh
    }

    pub(crate) fn push_notice(&self, notice: Notice) {
        lock(&self.notices).push(notice);
    }

    /// Every notice raised since the last call.
    pub fn take_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut *lock(&self.notices))
    }

    /// Remove a finished loop and return its final state.
    pub fn take_finished(&self, task_id: &str) -> Option<LoopState> {
        self.drain_events();
        let mut entry = if task_id == WATCHER_TASK {
            let mut watcher = lock(&self.watcher);
            if watcher.as_ref().is_some_and(|e| e.view.running) {
                return None;
            }
            watcher.take()?
        } else {
            let mut loops = lock(&self.loops);
            if loops.get(task_id)?.view.running {
                return None;
            }
            loops.remove(task_id)?
        };
        if let Some(handle) = entry.handle.take()
            && handle.join().is_none()
        {
            warn!(task_id, "loop worker had panicked");
        }
        Some(entry.view)
    }

    pub fn track(&self, kind: TrackKind, task_id: &str, window: &str) {
        self.tracking(kind)
            .insert(task_id.to_string(), window.to_string());
    }

    /// Watch `pane_id` for going idle and track the task as pending.
    pub fn track_pending(&self, task_id: &str, window: &str, pane_id: &str) {
        self.idle.register(task_id, pane_id);
        self.track(TrackKind::Pending, task_id, window);
    }

    pub fn untrack(&self, kind: TrackKind, task_id: &str) -> bool {
        if kind == TrackKind::Pending {
            self.idle.unregister(task_id);
        }
        self.tracking(kind).remove(task_id).is_some()
    }

    /// `(task, window)` pairs in a tracking set.
    pub fn tracked(&self, kind: TrackKind) -> Vec<(String, String)> {
        self.tracking(kind)
            .iter()
            .map(|(task, window)| (task.clone(), window.clone()))
            .collect()
    }

    fn tracking(&self, kind: TrackKind) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        match kind {
            TrackKind::Pending => lock(&self.pending),
            TrackKind::Awaiting => lock(&self.awaiting),
        }
    }

    /// Start the poll timer unless a live one exists. Returns whether one was started.
    pub fn ensure_poll_timer(self: &Arc<Self>) -> Result<bool> {
        let mut timer = lock(&self.timer);
        if timer.as_ref().is_some_and(PollTimer::is_running) {
            return Ok(false);
        }
        *timer = Some(self.spawn_poll_timer()?);
        Ok(true)
    }

    /// Discard the current poll timer and start a fresh one.
    pub fn restart_poll_timer(self: &Arc<Self>) -> Result<()> {
        let mut timer = lock(&self.timer);
        if let Some(old) = timer.take() {
            old.halt();
        }
        *timer = Some(self.spawn_poll_timer()?);
        info!("poll timer restarted");
        Ok(())
    }

    fn spawn_poll_timer(self: &Arc<Self>) -> Result<PollTimer> {
        let weak = Arc::downgrade(self);
        let tick = Duration::from_millis(self.settings.watchdog.poll_tick_ms);
        PollTimer::start("panefleet-poll", tick, move || {
            if let Some(supervisor) = weak.upgrade() {
                supervisor.poll_tick();
            }
        })
    }

    pub fn poll_timer_status(&self) -> Option<TimerStatus> {
        lock(&self.timer).as_ref().map(|t| TimerStatus {
            started_at: t.started_at(),
            last_tick: t.last_tick(),
            running: t.is_running(),
        })
    }

    /// Halt the poll timer without replacing it.
    pub fn halt_poll_timer(&self) {
        if let Some(timer) = lock(&self.timer).as_ref() {
            timer.halt();
        }
    }

    /// Force views whose worker thread is gone out of the running state.
    /// Returns the affected task ids.
    pub fn reap_dead_workers(&self) -> Vec<String> {
        self.drain_events();
        let suspects: Vec<String> = lock(&self.loops)
            .iter()
            .filter(|(_, e)| e.worker_dead())
            .map(|(task, _)| task.clone())
            .collect();
        let watcher_suspect = lock(&self.watcher).as_ref().is_some_and(LoopEntry::worker_dead);
        if suspects.is_empty() && !watcher_suspect {
            return Vec::new();
        }

        // A worker that exited normally published `Finished` before exiting.
        self.drain_events();
        let mut dead = Vec::new();
        {
            let mut loops = lock(&self.loops);
            for task_id in suspects {
                if let Some(entry) = loops.get_mut(&task_id)
                    && entry.worker_dead()
                {
                    Self::mark_dead(entry);
                    dead.push(task_id);
                }
            }
        }
        if let Some(entry) = lock(&self.watcher).as_mut()
            && entry.worker_dead()
        {
            Self::mark_dead(entry);
            dead.push(entry.view.task_id.clone());
        }
        for task_id in &dead {
            self.push_notice(Notice::task(task_id, NoticeKind::WorkerDied, "loop worker died unexpectedly"));
        }
        dead
    }

    fn mark_dead(entry: &mut LoopEntry) {
        error!(task = %entry.view.task_id, loop_id = %entry.view.loop_id, "loop worker died while marked running");
        entry.view.running = false;
        entry.view.awaiting_human = false;
        if entry.view.latest_verdict.is_none() {
            entry.view.latest_verdict = Some(ERROR.to_string());
            entry.view.latest_output = "loop worker exited unexpectedly".to_string();
        }
        if let Some(handle) = entry.handle.take()
            && handle.join().is_none()
        {
            warn!(task = %entry.view.task_id, "loop worker panicked");
        }
    }

    /// Persist every running loop for a restart. Returns how many were saved.
    pub fn save_breadcrumb(&self) -> Result<usize> {
        self.drain_events();
        let mut crumbs = BTreeMap::new();
        for (task_id, entry) in &*lock(&self.loops) {
            if entry.view.running {
                crumbs.insert(task_id.clone(), LoopCrumb::capture(&entry.view, &entry.config));
            }
        }
        if let Some(entry) = lock(&self.watcher).as_ref()
            && entry.view.running
        {
            crumbs.insert(entry.view.task_id.clone(), LoopCrumb::capture(&entry.view, &entry.config));
        }
        let count = crumbs.len();
        if count > 0 {
            save_breadcrumb(self.store.as_ref(), crumbs)?;
        }
        Ok(count)
    }

    /// Consume the breadcrumb and bring its loops back.
    ///
    /// A loop whose task is still active restarts from its saved iteration and
    /// reuses the task's pane; a finished task keeps its state without a worker.
    /// A loop that fails to start is reported and does not stop the others.
    pub fn resume_from_breadcrumb(&self, probe: &dyn SubjectProbe) -> Result<Vec<(String, ResumeOutcome)>> {
        let Some(crumb) = consume_breadcrumb(self.store.as_ref())? else {
            return Ok(Vec::new());
        };
        let mut outcomes = Vec::new();
        for (task_id, saved) in crumb.loops {
            let mut state = saved.restore(&task_id);
            let mut config = LoopConfig::for_kind(saved.kind, &self.settings);
            saved.apply_to(&mut config);
            let status = if saved.kind == LoopKind::Watcher {
                SubjectStatus::Active
            } else {
                probe.status(&task_id)
            };
            let outcome = match status {
                SubjectStatus::Missing => {
                    warn!(%task_id, "task of saved loop no longer exists");
                    ResumeOutcome::Dropped
                }
                SubjectStatus::Terminal => {
                    state.running = false;
                    state.ui_notified_done = true;
                    let entry = LoopEntry {
                        view: state,
                        config,
                        handle: None,
                    };
                    if saved.kind == LoopKind::Watcher {
                        *lock(&self.watcher) = Some(entry);
                    } else {
                        lock(&self.loops).insert(task_id.clone(), entry);
                    }
                    info!(%task_id, "task finished while restarting, kept loop state");
                    ResumeOutcome::Restored
                }
                SubjectStatus::Active => match self.start_loop(state, config, Some(LaunchMode::Reuse)) {
                    Ok(_) => {
                        info!(%task_id, iteration = saved.iteration, "resumed loop");
                        ResumeOutcome::Resumed
                    }
                    Err(err) => {
                        warn!(%task_id, err = %format!("{err:#}"), "could not resume saved loop");
                        ResumeOutcome::Failed
                    }
                },
            };
            outcomes.push((task_id, outcome));
        }
        Ok(outcomes)
    }

    /// Cancel every loop and stop the poll timer.
    pub fn shutdown(&self) {
        for entry in lock(&self.loops).values() {
            if let Some(handle) = &entry.handle {
                handle.request_stop();
            }
        }
        if let Some(handle) = lock(&self.watcher).as_ref().and_then(|e| e.handle.as_ref()) {
            handle.request_stop();
        }
        if let Some(timer) = lock(&self.timer).take() {
            timer.stop();
        }
    }
}
