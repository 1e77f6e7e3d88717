//! Loop engine scenarios: worker, supervisor, breadcrumb and watchdog together.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use panefleet::breadcrumb::{BREADCRUMB_NAME, Breadcrumb};
use panefleet::io::config::Settings;
use panefleet::io::store::{MemoryStore, StateStore};
use panefleet::looping::{KILLED, LoopConfig, LoopKind, LoopRunner, LoopState, is_error_verdict};
use panefleet::provider::{LaunchMode, SubjectStatus};
use panefleet::supervisor::{ResumeOutcome, Supervisor};
use panefleet::test_support::{FakeMux, PaneScript, ScriptedProbe, ScriptedProvider};
use panefleet::watchdog::Watchdog;

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.loops.poll_interval_ms = 1;
    settings.loops.tick_ms = 1;
    settings.loops.launch_settle_ms = 0;
    settings.loops.grace_period_secs = 0;
    settings.loops.iteration_wait_secs = 0;
    settings.watchdog.poll_tick_ms = 1;
    settings.watchdog.poll_stale_ms = 50;
    settings
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
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
fn review_loses_pane_after_three_rounds_of_feedback() {
    let mux = Arc::new(FakeMux::new());
    let provider = Arc::new(ScriptedProvider::new(mux.clone(), "proj"));
    for _ in 0..3 {
        provider.push(PaneScript::frames(&["reviewing", "NEEDS_WORK"]));
    }
    provider.push(PaneScript::Vanish);

    let (tx, rx) = mpsc::channel();
    let settings = fast_settings();
    let runner = LoopRunner::new(
        LoopConfig::review(&settings),
        LoopState::new("pr-7", LoopKind::Review),
        provider.clone(),
        mux.clone(),
        tx,
    );
    let state = runner.run();

    assert!(!state.running);
    assert_eq!(state.iteration, 4);
    assert_eq!(state.latest_verdict.as_deref(), Some(KILLED));
    assert!(state.ended_in_error());
    assert_eq!(state.history.len(), 3);
    assert!(state.history.iter().all(|h| h.verdict == "NEEDS_WORK"));
    assert!(state.history.iter().all(|h| !is_error_verdict(&h.verdict)));

    let events: Vec<_> = rx.try_iter().collect();
    assert!(events.last().is_some_and(|e| !e.snapshot.running));
}

#[test]
fn breadcrumb_resumes_review_with_same_stability_and_reused_pane() {
    let mux = Arc::new(FakeMux::new());
    let provider = Arc::new(ScriptedProvider::new(mux.clone(), "proj"));
    let store = Arc::new(MemoryStore::new());
    let settings = fast_settings();

    // A review at iteration 5 whose next round never settles on a verdict.
    let first = Supervisor::new(mux.clone(), provider.clone(), store.clone(), settings.clone());
    let mut state = LoopState::new("pr-5", LoopKind::Review);
    state.iteration = 5;
    let config = LoopConfig {
        stability_polls: 3,
        noise_tolerance: 1,
        ..LoopConfig::review(&settings)
    };
    provider.push(PaneScript::frames(&["still reviewing"]));
    first.start_loop(state, config, None).expect("start");
    assert!(wait_until(|| provider.requests().len() == 1));
    assert_eq!(first.save_breadcrumb().expect("save"), 1);
    first.shutdown();
    assert!(wait_until(|| {
        first.drain_events();
        !first.is_running("pr-5")
    }));

    let raw = store.read(BREADCRUMB_NAME).expect("read").expect("breadcrumb written");
    let crumb: Breadcrumb = serde_json::from_str(&raw).expect("parse");
    let saved = &crumb.loops["pr-5"];
    assert_eq!(saved.iteration, 5);
    assert_eq!((saved.stability_polls, saved.noise_tolerance), (3, 1));

    let probe = ScriptedProbe::new();
    probe.set_status("pr-5", SubjectStatus::Active);
    provider.push(PaneScript::frames(&["PASS"]));
    let second = Supervisor::new(mux.clone(), provider.clone(), store.clone(), settings);
    let outcomes = second.resume_from_breadcrumb(&probe).expect("resume");
    assert_eq!(outcomes, vec![("pr-5".to_string(), ResumeOutcome::Resumed)]);

    assert!(wait_until(|| {
        second.drain_events();
        !second.is_running("pr-5")
    }));
    let requests = provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], ("pr-5".to_string(), 6, LaunchMode::Fresh));
    assert_eq!(requests[1], ("pr-5".to_string(), 6, LaunchMode::Reuse));
    assert!(!store.exists(BREADCRUMB_NAME).expect("exists"));

    let finished = second.take_finished("pr-5").expect("finished");
    assert_eq!(finished.latest_verdict.as_deref(), Some("PASS"));
    assert_eq!(finished.iteration, 6);
}

#[test]
fn watchdog_repairs_dead_worker_and_missing_timer() {
    let mux = Arc::new(FakeMux::new());
    let provider = Arc::new(ScriptedProvider::new(mux.clone(), "proj"));
    let supervisor = Arc::new(Supervisor::new(
        mux.clone(),
        provider.clone(),
        Arc::new(MemoryStore::new()),
        fast_settings(),
    ));
    let watchdog = Watchdog::new(supervisor.clone(), Arc::new(ScriptedProbe::new()));

    provider.push(PaneScript::frames(&["working"]));
    provider.push(PaneScript::Panic);
    supervisor.start_monitor("mon-1").expect("monitor");
    assert!(wait_until(|| provider.requests().len() == 1));
    supervisor.start_review("pr-1", true).expect("review");

    let mut dead = Vec::new();
    let mut restarted = false;
    assert!(wait_until(|| {
        let report = watchdog.tick();
        dead.extend(report.dead_workers);
        restarted |= report.timer_restarted;
        !dead.is_empty()
    }));
    assert_eq!(dead, vec!["pr-1".to_string()]);
    assert!(restarted);
    assert!(supervisor.is_running("mon-1"));
    supervisor.shutdown();
}
