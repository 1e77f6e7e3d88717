//! Pane activity tracking.
//!
//! [`PaneIdleTracker`] fingerprints each tracked pane's captured content on
//! every poll and flags the pane idle once the fingerprint has not changed for
//! the configured threshold. Readers (`is_idle`, `is_gone`, `content`) only
//! touch in-memory state and are cheap enough for a render path; the capture
//! itself happens in [`PaneIdleTracker::poll`], outside the lock.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::io::tmux::Multiplexer;
use crate::sync::lock;

/// Default idle threshold.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(30);

/// Trailing lines inspected by [`has_interactive_prompt`].
const PROMPT_SCAN_LINES: usize = 25;

/// Source of monotonic time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Short content fingerprint (first 8 bytes of SHA-256, hex).
pub fn fingerprint(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(&digest[..8])
}

#[derive(Debug, Clone)]
struct IdleState {
    pane_id: String,
    /// Bumped on every (re)registration so stale captures can be discarded.
    epoch: u64,
    fingerprint: Option<String>,
    content: String,
    last_change: Instant,
    idle: bool,
    gone: bool,
    notified: bool,
}

pub struct PaneIdleTracker {
    mux: Arc<dyn Multiplexer>,
    clock: Arc<dyn Clock>,
    threshold: Duration,
    states: Mutex<HashMap<String, IdleState>>,
    next_epoch: Mutex<u64>,
}

impl PaneIdleTracker {
    pub fn new(mux: Arc<dyn Multiplexer>, threshold: Duration) -> Self {
        Self::with_clock(mux, Arc::new(SystemClock), threshold)
    }

    pub fn with_clock(mux: Arc<dyn Multiplexer>, clock: Arc<dyn Clock>, threshold: Duration) -> Self {
        Self {
            mux,
            clock,
            threshold,
            states: Mutex::new(HashMap::new()),
            next_epoch: Mutex::new(0),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Start tracking `key` on `pane_id`.
    ///
    /// Re-registering the same live pane keeps the accumulated state; a new
    /// pane, or a pane previously seen gone, starts over.
    pub fn register(&self, key: &str, pane_id: &str) {
        let mut states = lock(&self.states);
        if let Some(state) = states.get(key)
            && state.pane_id == pane_id
            && !state.gone
        {
            return;
        }
        let epoch = {
            let mut next = lock(&self.next_epoch);
            *next += 1;
            *next
        };
        debug!(key, pane_id, "tracking pane activity");
        states.insert(
            key.to_string(),
            IdleState {
                pane_id: pane_id.to_string(),
                epoch,
                fingerprint: None,
                content: String::new(),
                last_change: self.clock.now(),
                idle: false,
                gone: false,
                notified: false,
            },
        );
    }

    pub fn unregister(&self, key: &str) {
        lock(&self.states).remove(key);
    }

    /// Capture the pane once and update its state. Returns whether it is idle.
    pub fn poll(&self, key: &str) -> bool {
        let Some((pane_id, epoch)) = lock(&self.states)
            .get(key)
            .map(|s| (s.pane_id.clone(), s.epoch))
        else {
            return false;
        };

        if !self.mux.pane_exists(&pane_id) {
            let mut states = lock(&self.states);
            if let Some(state) = states.get_mut(key)
                && state.epoch == epoch
            {
                state.gone = true;
                state.idle = false;
            }
            return false;
        }

        let content = match self.mux.capture_pane(&pane_id) {
            Ok(content) => content,
            Err(err) => {
                warn!(key, pane_id, err = %format!("{err:#}"), "capture failed, retrying next poll");
                return self.is_idle(key);
            }
        };
        let hash = fingerprint(&content);
        let now = self.clock.now();

        let mut states = lock(&self.states);
        let Some(state) = states.get_mut(key) else {
            return false;
        };
        if state.epoch != epoch {
            // Re-registered while capturing; this capture belongs to the old pane.
            return false;
        }
        if state.fingerprint.as_deref() != Some(hash.as_str()) {
            state.fingerprint = Some(hash);
            state.last_change = now;
            state.idle = false;
            state.notified = false;
        } else if now.saturating_duration_since(state.last_change) >= self.threshold {
            state.idle = true;
        }
        state.content = content;
        state.idle
    }

    pub fn is_idle(&self, key: &str) -> bool {
        lock(&self.states).get(key).is_some_and(|s| s.idle)
    }

    /// True exactly once per transition into idle.
    pub fn became_idle(&self, key: &str) -> bool {
        let mut states = lock(&self.states);
        match states.get_mut(key) {
            Some(state) if state.idle && !state.notified => {
                state.notified = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_gone(&self, key: &str) -> bool {
        lock(&self.states).get(key).is_some_and(|s| s.gone)
    }

    pub fn is_tracked(&self, key: &str) -> bool {
        lock(&self.states).contains_key(key)
    }

    pub fn tracked_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.states).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Treat the pane as freshly active.
    pub fn mark_active(&self, key: &str) {
        let now = self.clock.now();
        if let Some(state) = lock(&self.states).get_mut(key) {
            state.last_change = now;
            state.idle = false;
            state.notified = false;
        }
    }

    /// Last captured content, or empty for an unknown key.
    pub fn content(&self, key: &str) -> String {
        lock(&self.states)
            .get(key)
            .map(|s| s.content.clone())
            .unwrap_or_default()
    }
}

static ENUMERATED_OPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\s+\S").expect("valid option regex"));

/// True when the content ends on an interactive selector waiting for a human.
///
/// A selector is a line led by `❯` followed by option text that is either
/// enumerated (`1. Yes`) or followed by another indented option line. A bare
/// `❯` is an ordinary shell prompt.
pub fn has_interactive_prompt(content: &str) -> bool {
    let lines: Vec<&str> = content.lines().collect();
    let tail = &lines[lines.len().saturating_sub(PROMPT_SCAN_LINES)..];
    tail.iter().enumerate().any(|(i, line)| {
        let Some(rest) = line.trim_start().strip_prefix('❯') else {
            return false;
        };
        let option = rest.trim();
        if option.is_empty() {
            return false;
        }
        if ENUMERATED_OPTION.is_match(option) {
            return true;
        }
        tail.get(i + 1).is_some_and(|next| {
            next.starts_with("  ") && !next.trim().is_empty() && !next.contains('❯')
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeMux, ManualClock};

    fn tracker(threshold: Duration) -> (Arc<FakeMux>, Arc<ManualClock>, PaneIdleTracker, String) {
        let mux = Arc::new(FakeMux::new());
        let window = mux.add_window("s", 200, 50);
        let pane = mux.add_pane("s", &window);
        let clock = Arc::new(ManualClock::new());
        let tracker = PaneIdleTracker::with_clock(mux.clone(), clock.clone(), threshold);
        (mux, clock, tracker, pane)
    }

    #[test]
    fn becomes_idle_after_threshold_without_change() {
        let (mux, clock, tracker, pane) = tracker(Duration::from_secs(30));
        mux.set_content(&pane, "working");
        tracker.register("k", &pane);
        assert!(!tracker.poll("k"));

        clock.advance(Duration::from_secs(29));
        assert!(!tracker.poll("k"));
        clock.advance(Duration::from_secs(1));
        assert!(tracker.poll("k"));
        assert!(tracker.is_idle("k"));
        assert_eq!(tracker.content("k"), "working");
    }

    #[test]
    fn change_resets_idle_and_one_shot() {
        let (mux, clock, tracker, pane) = tracker(Duration::from_secs(5));
        mux.set_content(&pane, "a");
        tracker.register("k", &pane);
        tracker.poll("k");
        clock.advance(Duration::from_secs(5));
        assert!(tracker.poll("k"));
        assert!(tracker.became_idle("k"));
        assert!(!tracker.became_idle("k"));

        mux.set_content(&pane, "b");
        assert!(!tracker.poll("k"));
        assert!(!tracker.became_idle("k"));

        clock.advance(Duration::from_secs(5));
        assert!(tracker.poll("k"));
        assert!(tracker.became_idle("k"));
    }

    #[test]
    fn capture_failure_keeps_last_state() {
        let (mux, clock, tracker, pane) = tracker(Duration::from_secs(5));
        mux.set_content(&pane, "done");
        tracker.register("k", &pane);
        tracker.poll("k");
        clock.advance(Duration::from_secs(5));
        assert!(tracker.poll("k"));

        mux.fail_captures(&pane, true);
        assert!(tracker.poll("k"));
        assert!(!tracker.is_gone("k"));

        mux.fail_captures(&pane, false);
        mux.set_content(&pane, "more output");
        assert!(!tracker.poll("k"));
    }

    #[test]
    fn gone_pane_is_not_idle() {
        let (mux, clock, tracker, pane) = tracker(Duration::from_secs(1));
        mux.set_content(&pane, "x");
        tracker.register("k", &pane);
        tracker.poll("k");
        clock.advance(Duration::from_secs(2));
        assert!(tracker.poll("k"));

        mux.remove_pane(&pane);
        assert!(!tracker.poll("k"));
        assert!(tracker.is_gone("k"));
        assert!(!tracker.is_idle("k"));
    }

    #[test]
    fn reregistering_same_pane_keeps_state() {
        let (mux, clock, tracker, pane) = tracker(Duration::from_secs(1));
        mux.set_content(&pane, "x");
        tracker.register("k", &pane);
        tracker.poll("k");
        clock.advance(Duration::from_secs(1));
        assert!(tracker.poll("k"));
        tracker.register("k", &pane);
        assert!(tracker.is_idle("k"));
    }

    #[test]
    fn mark_active_and_unregister() {
        let (mux, clock, tracker, pane) = tracker(Duration::from_secs(1));
        mux.set_content(&pane, "x");
        tracker.register("k", &pane);
        tracker.poll("k");
        clock.advance(Duration::from_secs(1));
        assert!(tracker.poll("k"));
        tracker.mark_active("k");
        assert!(!tracker.is_idle("k"));
        assert_eq!(tracker.tracked_keys(), vec!["k".to_string()]);

        tracker.unregister("k");
        assert!(!tracker.is_tracked("k"));
        assert_eq!(tracker.content("k"), "");
        assert!(!tracker.poll("k"));
    }

    #[test]
    fn detects_trust_folder_selector() {
        let content = "Do you trust the files in this folder?\n\n \u{276f} 1. Yes, I trust this folder\n   2. No, exit\n";
        assert!(has_interactive_prompt(content));
    }

    #[test]
    fn detects_permission_selector() {
        let content = "? Allow Read on src/main.rs\n \u{276f} Allow once\n   Allow always\n   Deny\n";
        assert!(has_interactive_prompt(content));
    }

    #[test]
    fn selector_anywhere_in_tail_counts() {
        let mut content = String::from(" \u{276f} 1. Yes\n   2. No\n");
        for i in 0..20 {
            content.push_str(&format!("line {i}\n"));
        }
        assert!(has_interactive_prompt(&content));
    }

    #[test]
    fn ordinary_output_is_not_a_prompt() {
        assert!(!has_interactive_prompt("compiling...\nall tests passed\n"));
        assert!(!has_interactive_prompt(""));
        assert!(!has_interactive_prompt("\u{276f} "));
        assert!(!has_interactive_prompt("done\n\u{276f} \n"));
    }

    #[test]
    fn fingerprint_is_short_and_stable() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        assert_eq!(fingerprint("abc").len(), 16);
    }
}
