//! Shared deterministic types for pane orchestration.
//!
//! These types define the persisted registry shape and the snapshots exchanged
//! with the multiplexer adapter. They carry no I/O and serialize stably.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One registered pane inside a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneEntry {
    /// Opaque multiplexer handle (e.g. `%12`).
    pub id: String,
    pub role: String,
    /// Insertion order. Larger values are newer and receive more tiling space.
    pub order: i64,
    #[serde(default)]
    pub cmd: String,
}

/// Registered panes for one window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRecord {
    #[serde(default)]
    pub panes: Vec<PaneEntry>,
    /// Set once a human restructured the window; suppresses auto-rebalance.
    #[serde(default)]
    pub user_modified: bool,
    /// Largest order handed out so far, including panes since removed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_water: Option<i64>,
}

impl WindowRecord {
    /// Panes sorted by insertion order (oldest first).
    pub fn panes_by_order(&self) -> Vec<&PaneEntry> {
        let mut panes: Vec<&PaneEntry> = self.panes.iter().collect();
        panes.sort_by_key(|p| p.order);
        panes
    }

    /// A relaunched pane sorts after every pane the window ever held.
    pub fn next_order(&self) -> i64 {
        self.panes
            .iter()
            .map(|p| p.order)
            .chain(self.high_water)
            .max()
            .map_or(0, |max| max + 1)
    }

    pub fn contains(&self, pane_id: &str) -> bool {
        self.panes.iter().any(|p| p.id == pane_id)
    }
}

/// Persisted registry for one base session.
///
/// `windows` is required so that legacy flat records never deserialize into
/// this shape by accident.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    #[serde(default)]
    pub session: String,
    /// Minted once per session lifetime. Empty when never minted.
    #[serde(default)]
    pub generation: String,
    pub windows: BTreeMap<String, WindowRecord>,
}

impl RegistryRecord {
    pub fn empty(session: &str) -> Self {
        Self {
            session: session.to_string(),
            generation: String::new(),
            windows: BTreeMap::new(),
        }
    }

    pub fn pane_count(&self) -> usize {
        self.windows.values().map(|w| w.panes.len()).sum()
    }

    /// Window id holding `pane_id`, if any.
    pub fn window_of(&self, pane_id: &str) -> Option<&str> {
        self.windows
            .iter()
            .find(|(_, w)| w.contains(pane_id))
            .map(|(id, _)| id.as_str())
    }
}

/// A pane as reported live by the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePane {
    pub id: String,
    /// Position within the window; layout strings address panes by this index.
    pub index: u32,
}

/// Window dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

impl WindowSize {
    pub fn new(width: u32, height: u32) -> Option<Self> {
        (width > 0 && height > 0).then_some(Self { width, height })
    }

    /// Characters are roughly twice as tall as wide, so a window is physically
    /// landscape when `width >= 2 * height`.
    pub fn is_landscape(&self) -> bool {
        self.width >= self.height.saturating_mul(2)
    }
}

/// Direction of a split. `Horizontal` places panes side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitDirection {
    Horizontal,
    Vertical,
}

impl SplitDirection {
    /// Short form used by the multiplexer CLI (`h` / `v`).
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitDirection::Horizontal => "h",
            SplitDirection::Vertical => "v",
        }
    }
}

/// A multiplexer window summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    pub id: String,
    pub index: String,
    pub name: String,
}

/// Strip the grouped-session suffix (`base~2` -> `base`).
///
/// Grouped sessions share windows, so they share one registry record.
pub fn base_session_name(session: &str) -> &str {
    session.split('~').next().unwrap_or(session)
}
