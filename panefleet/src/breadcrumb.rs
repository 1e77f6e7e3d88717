//! Crash-recovery breadcrumb.
//!
//! Before a deliberate restart the host writes the resumable part of every
//! running loop to `breadcrumb.json`. The next process consumes it exactly
//! once (read, then delete) and resumes the loops where they were.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::verdict::DEFAULT_STABILITY_POLLS;
use crate::ids::timestamp;
use crate::io::store::{StateStore, to_json};
use crate::looping::{IterationRecord, LoopConfig, LoopKind, LoopState};

pub const BREADCRUMB_NAME: &str = "breadcrumb.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadcrumb {
    #[serde(default)]
    pub created_at: String,
    /// Resumable loops by task id.
    #[serde(default)]
    pub loops: BTreeMap<String, LoopCrumb>,
}

fn default_true() -> bool {
    true
}

fn default_stability_polls() -> u32 {
    DEFAULT_STABILITY_POLLS
}

/// Resumable state of one loop. Every field has a default so older or
/// hand-edited breadcrumbs still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopCrumb {
    #[serde(default)]
    pub kind: LoopKind,
    #[serde(default)]
    pub loop_id: String,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub latest_verdict: Option<String>,
    #[serde(default = "default_true")]
    pub stop_on_soft: bool,
    #[serde(default)]
    pub awaiting_human: bool,
    #[serde(default = "default_stability_polls")]
    pub stability_polls: u32,
    #[serde(default)]
    pub noise_tolerance: u32,
    /// History without pane output.
    #[serde(default)]
    pub history: Vec<IterationRecord>,
}

impl LoopCrumb {
    pub fn capture(state: &LoopState, config: &LoopConfig) -> Self {
        Self {
            kind: state.kind,
            loop_id: state.loop_id.clone(),
            iteration: state.iteration,
            latest_verdict: state.latest_verdict.clone(),
            stop_on_soft: state.stop_on_soft,
            awaiting_human: state.awaiting_human,
            stability_polls: config.stability_polls,
            noise_tolerance: config.noise_tolerance,
            history: state
                .history
                .iter()
                .map(|h| IterationRecord {
                    output: String::new(),
                    ..h.clone()
                })
                .collect(),
        }
    }

    /// Rebuild a (not yet running) loop state for `task_id`.
    pub fn restore(&self, task_id: &str) -> LoopState {
        let mut state = LoopState::new(task_id, self.kind);
        if !self.loop_id.is_empty() {
            state.loop_id = self.loop_id.clone();
        }
        state.iteration = self.iteration;
        state.latest_verdict = self.latest_verdict.clone();
        state.stop_on_soft = self.stop_on_soft;
        state.awaiting_human = self.awaiting_human;
        state.history = self.history.clone();
        state
    }

    /// Apply the saved stability settings to `config`.
    pub fn apply_to(&self, config: &mut LoopConfig) {
        config.stability_polls = self.stability_polls.max(1);
        config.noise_tolerance = self.noise_tolerance;
    }
}

pub fn save_breadcrumb(store: &dyn StateStore, loops: BTreeMap<String, LoopCrumb>) -> Result<()> {
    let count = loops.len();
    let crumb = Breadcrumb {
        created_at: timestamp(),
        loops,
    };
    store
        .write(BREADCRUMB_NAME, &to_json(&crumb)?)
        .context("write breadcrumb")?;
    info!(loops = count, "breadcrumb saved");
    Ok(())
}

/// Read and delete the breadcrumb. A corrupt breadcrumb is discarded.
pub fn consume_breadcrumb(store: &dyn StateStore) -> Result<Option<Breadcrumb>> {
    let Some(raw) = store.read(BREADCRUMB_NAME).context("read breadcrumb")? else {
        return Ok(None);
    };
    store.remove(BREADCRUMB_NAME).context("delete breadcrumb")?;
    match serde_json::from_str::<Breadcrumb>(&raw) {
        Ok(crumb) => {
            info!(loops = crumb.loops.len(), created_at = %crumb.created_at, "breadcrumb consumed");
            Ok(Some(crumb))
        }
        Err(err) => {
            warn!(err = %err, "discarding unreadable breadcrumb");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::Settings;
    use crate::io::store::MemoryStore;

    fn running_review() -> (LoopState, LoopConfig) {
        let mut state = LoopState::new("pr-9", LoopKind::Review);
        state.iteration = 5;
        state.latest_verdict = Some("NEEDS_WORK".to_string());
        state.stop_on_soft = false;
        state.history.push(IterationRecord {
            iteration: 5,
            verdict: "NEEDS_WORK".to_string(),
            output: "long pane output".to_string(),
            timestamp: "t".to_string(),
        });
        let config = LoopConfig {
            stability_polls: 3,
            noise_tolerance: 1,
            ..LoopConfig::review(&Settings::default())
        };
        (state, config)
    }

    #[test]
    fn capture_drops_output_and_restore_round_trips_state() {
        let (state, config) = running_review();
        let crumb = LoopCrumb::capture(&state, &config);
        assert_eq!(crumb.history[0].output, "");

        let restored = crumb.restore("pr-9");
        assert_eq!(restored.iteration, 5);
        assert_eq!(restored.loop_id, state.loop_id);
        assert!(!restored.stop_on_soft);
        assert!(!restored.running);

        let mut fresh = LoopConfig::review(&Settings::default());
        crumb.apply_to(&mut fresh);
        assert_eq!((fresh.stability_polls, fresh.noise_tolerance), (3, 1));
    }

    #[test]
    fn consume_reads_once() {
        let store = MemoryStore::new();
        let (state, config) = running_review();
        let mut loops = BTreeMap::new();
        loops.insert("pr-9".to_string(), LoopCrumb::capture(&state, &config));
        save_breadcrumb(&store, loops).expect("save");

        let crumb = consume_breadcrumb(&store).expect("consume").expect("present");
        assert!(crumb.loops.contains_key("pr-9"));
        assert_eq!(consume_breadcrumb(&store).expect("consume"), None);
    }

    #[test]
    fn missing_fields_default() {
        let store = MemoryStore::new();
        store
            .write(BREADCRUMB_NAME, r#"{"loops":{"pr-1":{"iteration":2}}}"#)
            .expect("write");
        let crumb = consume_breadcrumb(&store).expect("consume").expect("present");
        let entry = &crumb.loops["pr-1"];
        assert_eq!(entry.kind, LoopKind::Review);
        assert!(entry.stop_on_soft);
        assert_eq!(entry.stability_polls, DEFAULT_STABILITY_POLLS);
        let state = entry.restore("pr-1");
        assert_eq!(state.loop_id.len(), 4);
    }

    #[test]
    fn corrupt_breadcrumb_is_discarded() {
        let store = MemoryStore::new();
        store.write(BREADCRUMB_NAME, "{oops").expect("write");
        assert_eq!(consume_breadcrumb(&store).expect("consume"), None);
        assert!(!store.exists(BREADCRUMB_NAME).expect("exists"));
    }
}
