//! Persistent pane registry.
//!
//! One JSON record per base session lists the panes panefleet launched, per
//! window, with role, insertion order and launch command. The registry is the
//! source of truth for layout order; the multiplexer is the source of truth for
//! liveness. Every mutation is a load, mutate, save unit under the registry's
//! lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{LivePane, PaneEntry, RegistryRecord, WindowRecord, base_session_name};
use crate::ids::mint_generation;
use crate::io::store::{StateStore, to_json};
use crate::io::tmux::Multiplexer;
use crate::sync::lock;

const RECORD_SUFFIX: &str = ".json";

/// On-disk shapes accepted when loading.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Current(RegistryRecord),
    Legacy(LegacyRecord),
}

/// Single-window record written before windows were tracked separately.
#[derive(Deserialize)]
struct LegacyRecord {
    #[serde(default)]
    session: String,
    #[serde(default)]
    generation: String,
    #[serde(default = "legacy_window")]
    window: String,
    panes: Vec<PaneEntry>,
    #[serde(default)]
    user_modified: bool,
}

fn legacy_window() -> String {
    "0".to_string()
}

impl From<LegacyRecord> for RegistryRecord {
    fn from(legacy: LegacyRecord) -> Self {
        let mut record = RegistryRecord {
            session: legacy.session,
            generation: legacy.generation,
            windows: Default::default(),
        };
        record.windows.insert(
            legacy.window,
            WindowRecord {
                panes: legacy.panes,
                user_modified: legacy.user_modified,
                high_water: None,
            },
        );
        record
    }
}

/// Parse a stored record, upgrading legacy shapes.
///
/// Unreadable JSON yields an empty record for `session`.
pub fn parse_record(session: &str, raw: &str) -> RegistryRecord {
    let base = base_session_name(session);
    let mut record = match serde_json::from_str::<StoredRecord>(raw) {
        Ok(StoredRecord::Current(record)) => record,
        Ok(StoredRecord::Legacy(legacy)) => {
            info!(session = base, "upgrading legacy single-window registry");
            legacy.into()
        }
        Err(err) => {
            warn!(session = base, err = %err, "corrupt registry record, starting empty");
            RegistryRecord::empty(base)
        }
    };
    if record.session.is_empty() {
        record.session = base.to_string();
    }
    record
}

pub fn record_name(session: &str) -> String {
    format!("{}{RECORD_SUFFIX}", base_session_name(session))
}

/// Outcome of [`PaneRegistry::heal`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealReport {
    pub removed_panes: Vec<String>,
    pub removed_windows: Vec<String>,
}

pub struct PaneRegistry {
    store: Arc<dyn StateStore>,
    mux: Arc<dyn Multiplexer>,
    guard: Mutex<()>,
}

impl PaneRegistry {
    pub fn new(store: Arc<dyn StateStore>, mux: Arc<dyn Multiplexer>) -> Self {
        Self {
            store,
            mux,
            guard: Mutex::new(()),
        }
    }

    pub fn load(&self, session: &str) -> Result<RegistryRecord> {
        let name = record_name(session);
        let record = match self.store.read(&name)? {
            Some(raw) => parse_record(session, &raw),
            None => RegistryRecord::empty(base_session_name(session)),
        };
        Ok(record)
    }

    fn save(&self, record: &RegistryRecord) -> Result<()> {
        let name = record_name(&record.session);
        self.store
            .write(&name, &to_json(record)?)
            .with_context(|| format!("save registry {name}"))
    }

    /// Load, apply `mutate`, and save if anything changed.
    pub fn update<T>(
        &self,
        session: &str,
        mutate: impl FnOnce(&mut RegistryRecord) -> T,
    ) -> Result<T> {
        let _guard = lock(&self.guard);
        let mut record = self.load(session)?;
        let before = record.clone();
        let out = mutate(&mut record);
        if record != before {
            self.save(&record)?;
        }
        Ok(out)
    }

    /// Append a pane to `window` with the next insertion order.
    #[instrument(skip(self, cmd))]
    pub fn register(
        &self,
        session: &str,
        window: &str,
        pane_id: &str,
        role: &str,
        cmd: &str,
    ) -> Result<i64> {
        self.update(session, |record| {
            let window = record.windows.entry(window.to_string()).or_default();
            let order = window.next_order();
            window.high_water = Some(order);
            window.panes.push(PaneEntry {
                id: pane_id.to_string(),
                role: role.to_string(),
                order,
                cmd: cmd.to_string(),
            });
            debug!(order, "registered pane");
            order
        })
    }

    /// Insert a pane ahead of every existing pane in `window` and clear the
    /// window's `user_modified` flag.
    pub fn register_first(
        &self,
        session: &str,
        window: &str,
        pane_id: &str,
        role: &str,
        cmd: &str,
    ) -> Result<i64> {
        self.update(session, |record| {
            let window = record.windows.entry(window.to_string()).or_default();
            let order = window.panes.iter().map(|p| p.order).min().unwrap_or(1) - 1;
            window.panes.insert(
                0,
                PaneEntry {
                    id: pane_id.to_string(),
                    role: role.to_string(),
                    order,
                    cmd: cmd.to_string(),
                },
            );
            window.user_modified = false;
            order
        })
    }

    /// Remove `pane_id` from whichever window holds it. Returns whether it was registered.
    pub fn unregister(&self, session: &str, pane_id: &str) -> Result<bool> {
        self.update(session, |record| {
            let mut removed = false;
            for window in record.windows.values_mut() {
                let before = window.panes.len();
                window.panes.retain(|p| p.id != pane_id);
                removed |= window.panes.len() != before;
            }
            removed
        })
    }

    /// Kill a pane (errors tolerated) and drop it from the registry.
    pub fn kill_and_unregister(&self, session: &str, pane_id: &str) -> Result<bool> {
        if let Err(err) = self.mux.kill_pane(pane_id) {
            debug!(pane_id, err = %format!("{err:#}"), "kill failed, pane likely gone");
        }
        self.unregister(session, pane_id)
    }

    /// Registered pane with `role` that is also live, searching `window` or all windows.
    #[instrument(skip(self))]
    pub fn find_live(
        &self,
        session: &str,
        role: &str,
        window: Option<&str>,
    ) -> Result<Option<String>> {
        let record = self.load(session)?;
        let mut live_cache: HashMap<&str, Vec<LivePane>> = HashMap::new();
        for (window_id, data) in &record.windows {
            if window.is_some_and(|w| w != window_id.as_str()) {
                continue;
            }
            for pane in data.panes_by_order().into_iter().filter(|p| p.role == role) {
                let live = live_cache
                    .entry(window_id.as_str())
                    .or_insert_with(|| self.live_panes(session, window_id));
                if live.iter().any(|p| p.id == pane.id) {
                    debug!(pane_id = %pane.id, "found live pane");
                    return Ok(Some(pane.id.clone()));
                }
                debug!(pane_id = %pane.id, "registered pane is dead");
            }
        }
        Ok(None)
    }

    fn live_panes(&self, session: &str, window: &str) -> Vec<LivePane> {
        match self.mux.list_panes(session, window) {
            Ok(panes) => panes,
            Err(err) => {
                warn!(session, window, err = %format!("{err:#}"), "live pane query failed");
                Vec::new()
            }
        }
    }

    /// Drop registered panes the multiplexer no longer reports. Returns removed ids.
    ///
    /// An empty live report for a window that still has registered panes is
    /// treated as a failed query, not an empty window, and changes nothing.
    #[instrument(skip(self))]
    pub fn reconcile(&self, session: &str, window: &str) -> Result<Vec<String>> {
        let live = self.live_panes(session, window);
        self.update(session, |record| {
            let Some(data) = record.windows.get_mut(window) else {
                return Vec::new();
            };
            if live.is_empty() && !data.panes.is_empty() {
                info!("no live panes reported, skipping reconcile");
                return Vec::new();
            }
            let (alive, dead): (Vec<PaneEntry>, Vec<PaneEntry>) = data
                .panes
                .drain(..)
                .partition(|p| live.iter().any(|l| l.id == p.id));
            data.panes = alive;
            let removed: Vec<String> = dead.into_iter().map(|p| p.id).collect();
            if data.panes.is_empty() {
                record.windows.remove(window);
            }
            if !removed.is_empty() {
                info!(?removed, "removed dead panes");
            }
            removed
        })
    }

    /// Reset the session record with a freshly minted generation.
    pub fn mint_generation(&self, session: &str) -> Result<String> {
        let generation = mint_generation();
        self.update(session, |record| {
            record.generation = generation.clone();
            record.windows.clear();
        })?;
        info!(session, %generation, "minted session generation");
        Ok(generation)
    }

    pub fn generation(&self, session: &str) -> Result<String> {
        Ok(self.load(session)?.generation)
    }

    pub fn window(&self, session: &str, window: &str) -> Result<WindowRecord> {
        Ok(self
            .load(session)?
            .windows
            .get(window)
            .cloned()
            .unwrap_or_default())
    }

    pub fn set_user_modified(&self, session: &str, window: &str, modified: bool) -> Result<()> {
        self.update(session, |record| {
            record
                .windows
                .entry(window.to_string())
                .or_default()
                .user_modified = modified;
        })
    }

    /// Base session names with a persisted record.
    pub fn sessions(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .list(RECORD_SUFFIX)?
            .into_iter()
            .filter_map(|name| name.strip_suffix(RECORD_SUFFIX).map(str::to_string))
            .collect())
    }

    /// Startup repair: drop dead panes, vanished windows and empty windows.
    #[instrument(skip(self))]
    pub fn heal(&self, session: &str) -> Result<HealReport> {
        let record = self.load(session)?;
        let mut live_by_window: HashMap<String, Option<Vec<LivePane>>> = HashMap::new();
        for window_id in record.windows.keys() {
            let live = self.live_panes(session, window_id);
            let entry = if live.is_empty() && self.mux.window_exists(session, window_id) {
                // Window exists but could not be listed: leave it untouched.
                None
            } else {
                Some(live)
            };
            live_by_window.insert(window_id.clone(), entry);
        }

        let report = self.update(session, |record| {
            let mut report = HealReport::default();
            record.windows.retain(|window_id, data| {
                if let Some(Some(live)) = live_by_window.get(window_id) {
                    data.panes.retain(|p| {
                        let alive = live.iter().any(|l| l.id == p.id);
                        if !alive {
                            report.removed_panes.push(p.id.clone());
                        }
                        alive
                    });
                }
                let keep = !data.panes.is_empty();
                if !keep {
                    report.removed_windows.push(window_id.clone());
                }
                keep
            });
            report
        })?;
        if report != HealReport::default() {
            info!(?report, "healed registry");
        }
        Ok(report)
    }
}
