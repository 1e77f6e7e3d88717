//! Supervised verdict loops.
//!
//! A loop drives one task through iterations: get or launch an agent pane,
//! wait until the pane shows a stable verdict, record it, then stop or go
//! again. Review loops stop on a passing verdict; monitor and watcher loops
//! run until cancelled and pause while the agent waits for a human.
//!
//! The worker owns its [`LoopState`] and publishes snapshots to the host as
//! [`LoopEvent`]s. The host never writes to a running worker's state; it only
//! cancels it through the [`LoopHandle`].

use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::verdict::{ExtractOptions, VerdictStabilityTracker, extract_verdict};
use crate::ids::{new_loop_id, timestamp};
use crate::idle::has_interactive_prompt;
use crate::io::config::Settings;
use crate::io::tmux::Multiplexer;
use crate::provider::{LaunchMode, PaneProvider, PaneRequest};
use crate::sync::CancelToken;

/// Verdict recorded when the loop's pane disappeared.
pub const KILLED: &str = "KILLED";
/// Verdict recorded when an iteration failed outright.
pub const ERROR: &str = "ERROR";

/// Consecutive capture failures tolerated before an iteration fails.
const MAX_CAPTURE_FAILURES: u32 = 3;

pub fn is_error_verdict(verdict: &str) -> bool {
    verdict == KILLED || verdict == ERROR
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopKind {
    #[default]
    Review,
    Monitor,
    Watcher,
}

impl LoopKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopKind::Review => "review",
            LoopKind::Monitor => "monitor",
            LoopKind::Watcher => "watcher",
        }
    }
}

/// Verdict that pauses the loop until a human has answered the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwaitingHuman {
    pub verdict: String,
    /// Recorded instead when the agent repeats `verdict` after the pause.
    pub resume_verdict: String,
}

/// Behaviour of one loop kind.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub kind: LoopKind,
    /// Recognised verdict keywords.
    pub verdicts: Vec<String>,
    /// Verdicts that always end the loop.
    pub stop_verdicts: Vec<String>,
    /// Verdicts that end the loop only when `stop_on_soft` is set.
    pub soft_stop_verdicts: Vec<String>,
    pub awaiting: Option<AwaitingHuman>,
    /// Verdicts followed by `iteration_wait` before the next iteration.
    pub wait_verdicts: Vec<String>,
    /// `0` means unlimited.
    pub max_iterations: u32,
    pub launch_mode: LaunchMode,
    pub poll_interval: Duration,
    pub tick: Duration,
    pub iteration_wait: Duration,
    /// Verdicts seen this early in an iteration are ignored.
    pub grace_period: Duration,
    pub settle_delay: Duration,
    pub stability_polls: u32,
    pub noise_tolerance: u32,
    pub tail_lines: usize,
    pub history_limit: usize,
    pub output_keep_chars: usize,
}

fn strings(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

impl LoopConfig {
    pub fn review(settings: &Settings) -> Self {
        Self {
            kind: LoopKind::Review,
            verdicts: strings(&["PASS", "PASS_WITH_SUGGESTIONS", "NEEDS_WORK"]),
            stop_verdicts: strings(&["PASS"]),
            soft_stop_verdicts: strings(&["PASS_WITH_SUGGESTIONS"]),
            awaiting: None,
            wait_verdicts: Vec::new(),
            max_iterations: settings.loops.review_max_iterations,
            launch_mode: LaunchMode::Fresh,
            poll_interval: Duration::from_millis(settings.loops.poll_interval_ms),
            tick: Duration::from_millis(settings.loops.tick_ms),
            iteration_wait: Duration::ZERO,
            grace_period: Duration::ZERO,
            settle_delay: Duration::from_millis(settings.loops.launch_settle_ms),
            stability_polls: settings.verdict.stability_polls,
            noise_tolerance: settings.verdict.noise_tolerance,
            tail_lines: settings.verdict.tail_lines,
            history_limit: settings.loops.history_limit,
            output_keep_chars: settings.loops.output_keep_chars,
        }
    }

    pub fn monitor(settings: &Settings) -> Self {
        Self {
            kind: LoopKind::Monitor,
            verdicts: strings(&["READY", "INPUT_REQUIRED"]),
            stop_verdicts: Vec::new(),
            soft_stop_verdicts: Vec::new(),
            awaiting: Some(AwaitingHuman {
                verdict: "INPUT_REQUIRED".to_string(),
                resume_verdict: "READY".to_string(),
            }),
            wait_verdicts: strings(&["READY"]),
            max_iterations: 0,
            launch_mode: LaunchMode::Reuse,
            iteration_wait: Duration::from_secs(settings.loops.iteration_wait_secs),
            grace_period: Duration::from_secs(settings.loops.grace_period_secs),
            ..Self::review(settings)
        }
    }

    pub fn watcher(settings: &Settings) -> Self {
        Self {
            kind: LoopKind::Watcher,
            ..Self::monitor(settings)
        }
    }

    pub fn for_kind(kind: LoopKind, settings: &Settings) -> Self {
        match kind {
            LoopKind::Review => Self::review(settings),
            LoopKind::Monitor => Self::monitor(settings),
            LoopKind::Watcher => Self::watcher(settings),
        }
    }

    pub fn should_stop(&self, verdict: &str, stop_on_soft: bool) -> bool {
        self.stop_verdicts.iter().any(|v| v == verdict)
            || (stop_on_soft && self.soft_stop_verdicts.iter().any(|v| v == verdict))
    }
}

/// One completed iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub verdict: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    pub task_id: String,
    pub loop_id: String,
    pub kind: LoopKind,
    pub running: bool,
    pub stop_requested: bool,
    pub iteration: u32,
    pub latest_verdict: Option<String>,
    pub latest_output: String,
    pub history: Vec<IterationRecord>,
    pub awaiting_human: bool,
    /// Stop on soft verdicts such as `PASS_WITH_SUGGESTIONS`.
    pub stop_on_soft: bool,
    pub pane_id: Option<String>,
    pub window: Option<String>,
    pub ui_notified_done: bool,
    pub ui_notified_input: bool,
}

impl LoopState {
    pub fn new(task_id: impl Into<String>, kind: LoopKind) -> Self {
        Self {
            task_id: task_id.into(),
            loop_id: new_loop_id(),
            kind,
            running: false,
            stop_requested: false,
            iteration: 0,
            latest_verdict: None,
            latest_output: String::new(),
            history: Vec::new(),
            awaiting_human: false,
            stop_on_soft: true,
            pane_id: None,
            window: None,
            ui_notified_done: false,
            ui_notified_input: false,
        }
    }

    pub fn ended_in_error(&self) -> bool {
        self.latest_verdict.as_deref().is_some_and(is_error_verdict)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEventKind {
    Started,
    /// An iteration recorded (or revised) its verdict.
    Iteration,
    AwaitingHuman,
    Finished,
}

#[derive(Debug, Clone)]
pub struct LoopEvent {
    pub kind: LoopEventKind,
    pub snapshot: LoopState,
}

/// Keep the last `keep` characters of `text`; `0` keeps everything.
pub fn trim_output(text: &str, keep: usize) -> String {
    let count = text.chars().count();
    if keep == 0 || count <= keep {
        return text.to_string();
    }
    text.chars().skip(count - keep).collect()
}

enum PollEnd {
    Stable { verdict: String, content: String },
    Gone,
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
enum Waited {
    Elapsed,
    Gone,
    Cancelled,
}

enum Step {
    Continue,
    Stop,
}

/// The worker side of one loop.
pub struct LoopRunner {
    config: LoopConfig,
    state: LoopState,
    provider: Arc<dyn PaneProvider>,
    mux: Arc<dyn Multiplexer>,
    stability: VerdictStabilityTracker,
    cancel: CancelToken,
    events: Sender<LoopEvent>,
    first_mode: Option<LaunchMode>,
}

impl LoopRunner {
    pub fn new(
        config: LoopConfig,
        state: LoopState,
        provider: Arc<dyn PaneProvider>,
        mux: Arc<dyn Multiplexer>,
        events: Sender<LoopEvent>,
    ) -> Self {
        let stability = VerdictStabilityTracker::new(config.stability_polls, config.noise_tolerance);
        Self {
            config,
            state,
            provider,
            mux,
            stability,
            cancel: CancelToken::new(),
            events,
            first_mode: None,
        }
    }

    /// Override the launch mode of the first iteration only.
    pub fn with_first_mode(mut self, mode: LaunchMode) -> Self {
        self.first_mode = Some(mode);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run on a dedicated thread.
    pub fn spawn(self) -> Result<LoopHandle> {
        let cancel = self.cancel.clone();
        let task_id = self.state.task_id.clone();
        let name = format!("{}-{}", self.config.kind.as_str(), task_id);
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .with_context(|| format!("spawn loop worker for {task_id}"))?;
        Ok(LoopHandle {
            task_id,
            cancel,
            join,
        })
    }

    /// Run to completion on the current thread and return the final state.
    pub fn run(mut self) -> LoopState {
        self.state.running = true;
        self.state.stop_requested = false;
        info!(
            task = %self.state.task_id,
            loop_id = %self.state.loop_id,
            kind = self.config.kind.as_str(),
            iteration = self.state.iteration,
            "loop started"
        );
        self.emit(LoopEventKind::Started);

        loop {
            if self.cancel.is_cancelled() {
                info!(task = %self.state.task_id, iteration = self.state.iteration, "stop requested");
                self.state.stop_requested = true;
                break;
            }
            if self.config.max_iterations > 0 && self.state.iteration >= self.config.max_iterations {
                warn!(task = %self.state.task_id, max = self.config.max_iterations, "iteration cap reached");
                break;
            }
            self.state.iteration += 1;
            let mode = self.first_mode.take().unwrap_or(self.config.launch_mode);
            debug!(task = %self.state.task_id, iteration = self.state.iteration, ?mode, "iteration");
            match self.run_iteration(mode) {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => break,
                Err(err) => {
                    error!(task = %self.state.task_id, iteration = self.state.iteration, err = %format!("{err:#}"), "iteration failed");
                    self.state.latest_verdict = Some(ERROR.to_string());
                    self.state.latest_output = format!("{err:#}");
                    break;
                }
            }
        }

        self.state.running = false;
        self.state.awaiting_human = false;
        info!(task = %self.state.task_id, verdict = ?self.state.latest_verdict, iterations = self.state.iteration, "loop finished");
        self.emit(LoopEventKind::Finished);
        self.state
    }

    fn run_iteration(&mut self, mode: LaunchMode) -> Result<Step> {
        let task_id = self.state.task_id.clone();
        let loop_id = self.state.loop_id.clone();
        let request = PaneRequest {
            task_id: &task_id,
            kind: self.config.kind,
            iteration: self.state.iteration,
            loop_id: &loop_id,
            mode,
        };
        let pane = self
            .provider
            .acquire_pane(&request)
            .context("acquire agent pane")?;
        self.state.pane_id = Some(pane.pane_id.clone());
        self.state.window = Some(pane.window.clone());

        match self.sleep_checking_pane(&pane.pane_id, self.config.settle_delay) {
            Waited::Elapsed => {}
            Waited::Gone => return Ok(self.killed("pane disappeared after launch")),
            Waited::Cancelled => return Ok(self.stopped()),
        }

        let prompt = self.provider.instruction_text(&request);
        let (mut verdict, content) =
            match self.poll_for_verdict(&pane.pane_id, &prompt, &[], self.config.grace_period)? {
                PollEnd::Stable { verdict, content } => (verdict, content),
                PollEnd::Gone => return Ok(self.killed("pane disappeared before a verdict")),
                PollEnd::Cancelled => return Ok(self.stopped()),
            };
        info!(task = %task_id, iteration = self.state.iteration, %verdict, "verdict");
        self.record(&verdict, &content, false);
        self.emit(LoopEventKind::Iteration);

        if let Some(awaiting) = self.config.awaiting.clone()
            && verdict == awaiting.verdict
        {
            info!(task = %task_id, "agent awaits human input");
            self.state.awaiting_human = true;
            self.state.ui_notified_input = false;
            self.emit(LoopEventKind::AwaitingHuman);

            let prompt = self.provider.instruction_text(&request);
            let exclude = [awaiting.verdict.clone()];
            let follow_up = self.poll_for_verdict(&pane.pane_id, &prompt, &exclude, Duration::ZERO)?;
            self.state.awaiting_human = false;
            let (follow_verdict, content) = match follow_up {
                PollEnd::Stable { verdict, content } => (verdict, content),
                PollEnd::Gone => return Ok(self.killed("pane disappeared while awaiting input")),
                PollEnd::Cancelled => return Ok(self.stopped()),
            };
            let newest = extract_verdict(
                &content,
                &self.config.verdicts,
                &ExtractOptions {
                    prompt_text: &prompt,
                    exclude: &[],
                    tail_lines: self.config.tail_lines,
                },
            );
            verdict = match newest {
                Some(v) if v == awaiting.verdict => awaiting.resume_verdict.clone(),
                _ => follow_verdict,
            };
            info!(task = %task_id, %verdict, "follow-up verdict");
            self.record(&verdict, &content, true);
            self.emit(LoopEventKind::Iteration);
        }

        if self.config.should_stop(&verdict, self.state.stop_on_soft) {
            info!(task = %task_id, %verdict, "terminal verdict");
            return Ok(Step::Stop);
        }
        if self.cancel.is_cancelled() {
            return Ok(self.stopped());
        }
        if self.config.wait_verdicts.contains(&verdict) && !self.config.iteration_wait.is_zero() {
            debug!(task = %task_id, wait_ms = self.config.iteration_wait.as_millis() as u64, "waiting before next iteration");
            if self.cancel.wait_timeout(self.config.iteration_wait) {
                return Ok(self.stopped());
            }
        }
        Ok(Step::Continue)
    }

    /// Poll `pane_id` until the same verdict is seen on enough consecutive captures.
    fn poll_for_verdict(
        &self,
        pane_id: &str,
        prompt: &str,
        exclude: &[String],
        grace: Duration,
    ) -> Result<PollEnd> {
        self.stability.reset(pane_id);
        let started = Instant::now();
        let mut capture_failures = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(PollEnd::Cancelled);
            }
            if !self.mux.pane_exists(pane_id) {
                warn!(task = %self.state.task_id, pane_id, "pane disappeared");
                return Ok(PollEnd::Gone);
            }

            match self.mux.capture_pane(pane_id) {
                Ok(content) => {
                    capture_failures = 0;
                    if !content.trim().is_empty() && started.elapsed() >= grace {
                        let verdict = if has_interactive_prompt(&content) {
                            debug!(pane_id, "interactive prompt on screen, ignoring verdicts");
                            None
                        } else {
                            extract_verdict(
                                &content,
                                &self.config.verdicts,
                                &ExtractOptions {
                                    prompt_text: prompt,
                                    exclude,
                                    tail_lines: self.config.tail_lines,
                                },
                            )
                        };
                        if self.stability.update(pane_id, verdict.as_deref())
                            && let Some(verdict) = verdict
                        {
                            return Ok(PollEnd::Stable { verdict, content });
                        }
                    }
                }
                Err(err) => {
                    capture_failures += 1;
                    if capture_failures >= MAX_CAPTURE_FAILURES {
                        return Err(err.context(format!("capture {pane_id}")));
                    }
                    warn!(pane_id, err = %format!("{err:#}"), "capture failed, retrying");
                }
            }

            match self.sleep_checking_pane(pane_id, self.config.poll_interval) {
                Waited::Elapsed => {}
                Waited::Gone => return Ok(PollEnd::Gone),
                Waited::Cancelled => return Ok(PollEnd::Cancelled),
            }
        }
    }

    /// Sleep in `tick` slices, checking cancellation and pane liveness after each.
    fn sleep_checking_pane(&self, pane_id: &str, duration: Duration) -> Waited {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Waited::Elapsed;
            }
            let slice = self.config.tick.min(deadline - now);
            if self.cancel.wait_timeout(slice) {
                return Waited::Cancelled;
            }
            if !self.mux.pane_exists(pane_id) {
                return Waited::Gone;
            }
        }
    }

    fn record(&mut self, verdict: &str, content: &str, replace_last: bool) {
        let output = trim_output(content, self.config.output_keep_chars);
        self.state.latest_verdict = Some(verdict.to_string());
        self.state.latest_output = output.clone();
        let entry = IterationRecord {
            iteration: self.state.iteration,
            verdict: verdict.to_string(),
            output,
            timestamp: timestamp(),
        };
        match self.state.history.last_mut() {
            Some(last) if replace_last => *last = entry,
            _ => self.state.history.push(entry),
        }
        let limit = self.config.history_limit;
        if limit > 0 && self.state.history.len() > limit {
            let excess = self.state.history.len() - limit;
            self.state.history.drain(..excess);
        }
    }

    fn killed(&mut self, reason: &str) -> Step {
        warn!(task = %self.state.task_id, iteration = self.state.iteration, reason, "loop pane lost");
        self.state.latest_verdict = Some(KILLED.to_string());
        self.state.latest_output = reason.to_string();
        Step::Stop
    }

    fn stopped(&mut self) -> Step {
        info!(task = %self.state.task_id, iteration = self.state.iteration, "stopped by request");
        self.state.stop_requested = true;
        Step::Stop
    }

    fn emit(&self, kind: LoopEventKind) {
        let event = LoopEvent {
            kind,
            snapshot: self.state.clone(),
        };
        if self.events.send(event).is_err() {
            debug!(task = %self.state.task_id, "loop host gone, event dropped");
        }
    }
}

/// Host-side handle on a running loop worker.
#[derive(Debug)]
pub struct LoopHandle {
    task_id: String,
    cancel: CancelToken,
    join: JoinHandle<LoopState>,
}

impl LoopHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// True once the worker thread has exited, normally or by panic.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Ask the worker to stop at its next poll or sleep slice.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the worker. `None` when it panicked.
    pub fn join(self) -> Option<LoopState> {
        self.join.join().ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::test_support::{FakeMux, PaneScript, ScriptedProvider};

    fn fast(config: LoopConfig) -> LoopConfig {
        LoopConfig {
            poll_interval: Duration::from_millis(1),
            tick: Duration::from_millis(1),
            iteration_wait: Duration::ZERO,
            grace_period: Duration::ZERO,
            settle_delay: Duration::ZERO,
            ..config
        }
    }

    fn runner(
        config: LoopConfig,
        provider: Arc<ScriptedProvider>,
        mux: Arc<FakeMux>,
    ) -> (LoopRunner, mpsc::Receiver<LoopEvent>) {
        let (tx, rx) = mpsc::channel();
        let state = LoopState::new("pr-1", config.kind);
        (LoopRunner::new(fast(config), state, provider, mux, tx), rx)
    }

    fn setup() -> (Arc<FakeMux>, Arc<ScriptedProvider>) {
        let mux = Arc::new(FakeMux::new());
        let provider = Arc::new(ScriptedProvider::new(mux.clone(), "s"));
        (mux, provider)
    }

    #[test]
    fn review_stops_on_pass() {
        let (mux, provider) = setup();
        provider.push(PaneScript::frames(&["reviewing", "NEEDS_WORK"]));
        provider.push(PaneScript::frames(&["reviewing", "**PASS**"]));
        let (runner, rx) = runner(LoopConfig::review(&Settings::default()), provider.clone(), mux);

        let state = runner.run();
        assert!(!state.running);
        assert_eq!(state.iteration, 2);
        assert_eq!(state.latest_verdict.as_deref(), Some("PASS"));
        let verdicts: Vec<&str> = state.history.iter().map(|h| h.verdict.as_str()).collect();
        assert_eq!(verdicts, vec!["NEEDS_WORK", "PASS"]);
        assert!(provider.requests().iter().all(|r| r.2 == LaunchMode::Fresh));

        let kinds: Vec<LoopEventKind> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds.first(), Some(&LoopEventKind::Started));
        assert_eq!(kinds.last(), Some(&LoopEventKind::Finished));
        assert_eq!(kinds.iter().filter(|k| **k == LoopEventKind::Iteration).count(), 2);
    }

    #[test]
    fn soft_verdict_continues_when_configured() {
        let (mux, provider) = setup();
        provider.push(PaneScript::frames(&["PASS_WITH_SUGGESTIONS"]));
        provider.push(PaneScript::frames(&["PASS"]));
        let (runner, _rx) = runner(LoopConfig::review(&Settings::default()), provider, mux);
        let mut runner = runner;
        runner.state.stop_on_soft = false;

        let state = runner.run();
        assert_eq!(state.iteration, 2);
        assert_eq!(state.latest_verdict.as_deref(), Some("PASS"));
    }

    #[test]
    fn pane_loss_records_killed_without_history_entry() {
        let (mux, provider) = setup();
        for _ in 0..3 {
            provider.push(PaneScript::frames(&["NEEDS_WORK"]));
        }
        provider.push(PaneScript::Vanish);
        let (runner, _rx) = runner(LoopConfig::review(&Settings::default()), provider, mux);

        let state = runner.run();
        assert!(!state.running);
        assert_eq!(state.iteration, 4);
        assert_eq!(state.latest_verdict.as_deref(), Some(KILLED));
        assert!(state.ended_in_error());
        assert_eq!(state.history.len(), 3);
    }

    #[test]
    fn launch_failure_records_error() {
        let (mux, provider) = setup();
        provider.push(PaneScript::FailLaunch);
        let (runner, _rx) = runner(LoopConfig::review(&Settings::default()), provider, mux);

        let state = runner.run();
        assert_eq!(state.latest_verdict.as_deref(), Some(ERROR));
        assert!(state.latest_output.contains("acquire agent pane"));
        assert!(state.history.is_empty());
    }

    #[test]
    fn iteration_cap_is_a_hard_stop() {
        let (mux, provider) = setup();
        for _ in 0..5 {
            provider.push(PaneScript::frames(&["NEEDS_WORK"]));
        }
        let config = LoopConfig {
            max_iterations: 3,
            ..LoopConfig::review(&Settings::default())
        };
        let (runner, _rx) = runner(config, provider, mux);
        let state = runner.run();
        assert_eq!(state.iteration, 3);
        assert_eq!(state.history.len(), 3);
        assert_eq!(state.latest_verdict.as_deref(), Some("NEEDS_WORK"));
    }

    #[test]
    fn interactive_prompt_suppresses_verdict() {
        let (mux, provider) = setup();
        provider.push(PaneScript::frames(&[
            "PASS\n \u{276f} 1. Yes\n   2. No",
            "PASS\n \u{276f} 1. Yes\n   2. No",
            "NEEDS_WORK",
        ]));
        provider.push(PaneScript::frames(&["PASS"]));
        let (runner, _rx) = runner(LoopConfig::review(&Settings::default()), provider, mux);
        let state = runner.run();
        assert_eq!(state.history[0].verdict, "NEEDS_WORK");
    }

    #[test]
    fn awaiting_human_then_follow_up_replaces_history_entry() {
        let (mux, provider) = setup();
        provider.push(PaneScript::frames(&[
            "checking",
            "INPUT_REQUIRED",
            "INPUT_REQUIRED",
            "INPUT_REQUIRED\nthanks\nREADY",
        ]));
        let config = LoopConfig {
            max_iterations: 1,
            ..LoopConfig::monitor(&Settings::default())
        };
        let (runner, rx) = runner(config, provider.clone(), mux);

        let state = runner.run();
        assert_eq!(state.latest_verdict.as_deref(), Some("READY"));
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].verdict, "READY");
        assert!(!state.awaiting_human);

        let events: Vec<LoopEvent> = rx.try_iter().collect();
        let awaiting = events
            .iter()
            .find(|e| e.kind == LoopEventKind::AwaitingHuman)
            .expect("awaiting event");
        assert!(awaiting.snapshot.awaiting_human);
        assert_eq!(awaiting.snapshot.latest_verdict.as_deref(), Some("INPUT_REQUIRED"));
    }

    #[test]
    fn repeated_awaiting_verdict_resumes() {
        let (mux, provider) = setup();
        provider.push(PaneScript::frames(&[
            "INPUT_REQUIRED",
            "INPUT_REQUIRED",
            "READY\nstill stuck\nINPUT_REQUIRED",
        ]));
        let config = LoopConfig {
            max_iterations: 1,
            ..LoopConfig::monitor(&Settings::default())
        };
        let (runner, _rx) = runner(config, provider, mux);
        let state = runner.run();
        assert_eq!(state.latest_verdict.as_deref(), Some("READY"));
    }

    #[test]
    fn monitor_reuses_pane_and_cancel_interrupts_wait() {
        let (mux, provider) = setup();
        provider.push(PaneScript::frames(&["READY"]));
        let config = LoopConfig {
            iteration_wait: Duration::from_secs(60),
            ..fast(LoopConfig::monitor(&Settings::default()))
        };
        let (tx, _rx) = mpsc::channel();
        let state = LoopState::new("mon", LoopKind::Monitor);
        let runner = LoopRunner::new(config, state, provider.clone(), mux, tx);
        let handle = runner.spawn().expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(5);
        while provider.requests().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(50));
        handle.request_stop();
        let state = handle.join().expect("worker");
        assert!(state.stop_requested);
        assert!(!state.running);
        assert_eq!(state.latest_verdict.as_deref(), Some("READY"));
        assert_eq!(provider.requests()[0].2, LaunchMode::Reuse);
    }

    #[test]
    fn review_without_verdict_stops_on_request() {
        let (mux, provider) = setup();
        provider.push(PaneScript::frames(&["still reviewing"]));
        let (runner, _rx) = runner(LoopConfig::review(&Settings::default()), provider.clone(), mux);
        let handle = runner.spawn().expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(5);
        while provider.requests().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(20));
        handle.request_stop();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_finished());
        let state = handle.join().expect("worker");
        assert!(state.stop_requested);
        assert!(!state.running);
        assert!(state.history.is_empty());
        assert_eq!(state.iteration, 1);
    }

    #[test]
    fn history_is_bounded() {
        let (mux, provider) = setup();
        for _ in 0..4 {
            provider.push(PaneScript::frames(&["NEEDS_WORK"]));
        }
        let config = LoopConfig {
            max_iterations: 4,
            history_limit: 2,
            ..LoopConfig::review(&Settings::default())
        };
        let (runner, _rx) = runner(config, provider, mux);
        let state = runner.run();
        let iterations: Vec<u32> = state.history.iter().map(|h| h.iteration).collect();
        assert_eq!(iterations, vec![3, 4]);
    }

    #[test]
    fn trim_output_keeps_tail() {
        assert_eq!(trim_output("abcdef", 3), "def");
        assert_eq!(trim_output("abc", 10), "abc");
        assert_eq!(trim_output("abc", 0), "abc");
        assert_eq!(trim_output("ééé", 2), "éé");
    }

    #[test]
    fn soft_stop_rules() {
        let review = LoopConfig::review(&Settings::default());
        assert!(review.should_stop("PASS", false));
        assert!(review.should_stop("PASS_WITH_SUGGESTIONS", true));
        assert!(!review.should_stop("PASS_WITH_SUGGESTIONS", false));
        assert!(!review.should_stop("NEEDS_WORK", true));
        let monitor = LoopConfig::monitor(&Settings::default());
        assert!(!monitor.should_stop("READY", true));
        assert_eq!(monitor.max_iterations, 0);
    }
}
