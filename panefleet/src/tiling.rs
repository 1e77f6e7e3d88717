//! Applying layouts to live windows.
//!
//! [`Tiler`] combines the registry (desired pane order) with the multiplexer
//! (live panes, window size) and applies the layout computed by
//! [`crate::core::layout`].

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::layout::{desired_order, layout_for_leaves, leaf_number, plan_swaps, preferred_split};
use crate::core::types::{SplitDirection, WindowSize, base_session_name};
use crate::io::config::LayoutSettings;
use crate::io::store::StateStore;
use crate::io::tmux::Multiplexer;
use crate::registry::PaneRegistry;

/// Name of the per-session force-mobile flag record.
pub fn mobile_flag_name(session: &str) -> String {
    format!("{}.mobile", base_session_name(session))
}

pub struct Tiler {
    mux: Arc<dyn Multiplexer>,
    registry: Arc<PaneRegistry>,
    store: Arc<dyn StateStore>,
    settings: LayoutSettings,
}

impl Tiler {
    pub fn new(
        mux: Arc<dyn Multiplexer>,
        registry: Arc<PaneRegistry>,
        store: Arc<dyn StateStore>,
        settings: LayoutSettings,
    ) -> Self {
        Self {
            mux,
            registry,
            store,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<PaneRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &LayoutSettings {
        &self.settings
    }

    /// Window size, trying every session that shares the window.
    ///
    /// Grouped sessions share windows, but only a session with an attached
    /// client reports a non-zero size.
    pub fn window_size(&self, session: &str, window: &str) -> Option<WindowSize> {
        let base = base_session_name(session);
        let mut candidates: Vec<String> = Vec::new();
        if let Some(current) = self.mux.current_session()
            && base_session_name(&current) == base
        {
            candidates.push(current);
        }
        for name in [session, base] {
            if !candidates.iter().any(|c| c == name) {
                candidates.push(name.to_string());
            }
        }
        for grouped in self.mux.grouped_sessions(base) {
            if !candidates.contains(&grouped) {
                candidates.push(grouped);
            }
        }
        candidates
            .iter()
            .find_map(|candidate| self.mux.window_size(candidate, window))
    }

    pub fn preferred_split_direction(&self, session: &str, window: &str) -> SplitDirection {
        preferred_split(self.window_size(session, window))
    }

    pub fn set_force_mobile(&self, session: &str, enabled: bool) -> Result<()> {
        let name = mobile_flag_name(session);
        if enabled {
            self.store.write(&name, "")?;
        } else {
            self.store.remove(&name)?;
        }
        info!(session, enabled, "force-mobile flag updated");
        Ok(())
    }

    fn force_mobile(&self, session: &str) -> bool {
        self.store
            .exists(&mobile_flag_name(session))
            .unwrap_or_else(|err| {
                warn!(session, err = %format!("{err:#}"), "could not read mobile flag");
                false
            })
    }

    fn narrow(&self, size: Option<WindowSize>) -> bool {
        size.is_some_and(|s| s.width < self.settings.mobile_width_threshold)
    }

    /// Mobile mode: forced by flag, or a narrow window.
    pub fn is_mobile(&self, session: &str, window: &str) -> bool {
        self.force_mobile(session) || self.narrow(self.window_size(session, window))
    }

    /// Focus a pane, zooming it in mobile mode.
    pub fn select_pane_smart(&self, pane_id: &str, session: &str, window: &str) -> Result<()> {
        self.mux.select_pane(pane_id)?;
        if self.is_mobile(session, window) && !self.mux.is_zoomed(session, window) {
            self.mux.zoom_pane(pane_id)?;
        }
        Ok(())
    }

    /// Recompute and apply the layout of `window`. Returns whether a layout is in place.
    #[instrument(skip(self))]
    pub fn rebalance(&self, session: &str, window: &str) -> Result<bool> {
        self.registry.reconcile(session, window)?;

        let record = self.registry.window(session, window)?;
        if record.user_modified {
            info!("window is user-modified, skipping rebalance");
            return Ok(false);
        }
        let registered = record.panes_by_order();
        if registered.is_empty() {
            debug!("no registered panes");
            return Ok(false);
        }

        let Some(size) = self.window_size(session, window) else {
            warn!("window size unavailable");
            return Ok(false);
        };

        let live = self.mux.list_panes(session, window)?;
        let desired = desired_order(&registered, &live);
        match desired.len() {
            0 => {
                warn!("no live panes to lay out");
                return Ok(false);
            }
            1 => {
                debug!("single pane, nothing to lay out");
                return Ok(true);
            }
            _ => {}
        }

        let current: Vec<String> = live.iter().map(|p| p.id.clone()).collect();
        for (source, target) in plan_swaps(&current, &desired) {
            debug!(%source, %target, "swapping panes");
            self.mux.swap_panes(&source, &target)?;
        }

        let leaves: Option<Vec<u32>> = desired.iter().map(|id| leaf_number(id)).collect();
        let Some(leaves) = leaves else {
            warn!(?desired, "pane ids are not numeric, cannot build layout");
            return Ok(false);
        };
        let Some(layout) = layout_for_leaves(&leaves, size.width, size.height) else {
            return Ok(false);
        };
        info!(panes = leaves.len(), %layout, "applying layout");
        if let Err(err) = self.mux.apply_layout(session, window, &layout) {
            warn!(err = %format!("{err:#}"), "layout rejected");
            return Ok(false);
        }

        if (self.force_mobile(session) || self.narrow(Some(size)))
            && let Some(active) = self.mux.active_pane(session, window)
        {
            info!(pane_id = %active, "mobile mode, zooming active pane");
            self.mux.zoom_pane(&active)?;
        }
        Ok(true)
    }

    /// Flag the window user-modified when the registry no longer covers every live pane.
    pub fn check_user_modified(&self, session: &str, window: &str) -> Result<bool> {
        let record = self.registry.window(session, window)?;
        if record.user_modified {
            return Ok(true);
        }
        if record.panes.len() < 2 {
            return Ok(false);
        }
        let live = self.mux.list_panes(session, window)?;
        if live.is_empty() {
            return Ok(false);
        }
        let registered_live = record
            .panes
            .iter()
            .filter(|p| live.iter().any(|l| l.id == p.id))
            .count();
        if registered_live != live.len() {
            info!(session, window, registered_live, live = live.len(), "layout modified by hand");
            self.registry.set_user_modified(session, window, true)?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::store::MemoryStore;
    use crate::test_support::FakeMux;

    fn setup(width: u32, height: u32) -> (Arc<FakeMux>, Tiler, String) {
        let mux = Arc::new(FakeMux::new());
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(PaneRegistry::new(store.clone(), mux.clone()));
        let window = mux.add_window("s", width, height);
        let tiler = Tiler::new(mux.clone(), registry, store, LayoutSettings::default());
        (mux, tiler, window)
    }

    #[test]
    fn rebalance_orders_panes_and_applies_layout() {
        let (mux, tiler, window) = setup(200, 50);
        let a = mux.add_pane("s", &window);
        let b = mux.add_pane("s", &window);
        let c = mux.add_pane("s", &window);
        // Registry order differs from live order: c is oldest.
        tiler.registry().register("s", &window, &c, "c", "").expect("reg");
        tiler.registry().register("s", &window, &a, "a", "").expect("reg");
        tiler.registry().register("s", &window, &b, "b", "").expect("reg");

        assert!(tiler.rebalance("s", &window).expect("rebalance"));
        assert_eq!(mux.pane_order(&window), vec![c.clone(), a.clone(), b.clone()]);

        let leaves: Vec<u32> = [&c, &a, &b]
            .iter()
            .map(|id| leaf_number(id).expect("leaf"))
            .collect();
        let expected = layout_for_leaves(&leaves, 200, 50).expect("layout");
        assert_eq!(mux.last_layout(&window), Some(expected));
    }

    #[test]
    fn rebalance_skips_user_modified_window() {
        let (mux, tiler, window) = setup(200, 50);
        let a = mux.add_pane("s", &window);
        let b = mux.add_pane("s", &window);
        tiler.registry().register("s", &window, &a, "a", "").expect("reg");
        tiler.registry().register("s", &window, &b, "b", "").expect("reg");
        tiler.registry().set_user_modified("s", &window, true).expect("flag");

        assert!(!tiler.rebalance("s", &window).expect("rebalance"));
        assert_eq!(mux.last_layout(&window), None);
    }

    #[test]
    fn rebalance_single_pane_is_noop_success() {
        let (mux, tiler, window) = setup(200, 50);
        let a = mux.add_pane("s", &window);
        tiler.registry().register("s", &window, &a, "a", "").expect("reg");
        assert!(tiler.rebalance("s", &window).expect("rebalance"));
        assert_eq!(mux.last_layout(&window), None);
    }

    #[test]
    fn rebalance_covers_unregistered_live_panes() {
        let (mux, tiler, window) = setup(200, 50);
        let a = mux.add_pane("s", &window);
        let stray = mux.add_pane("s", &window);
        tiler.registry().register("s", &window, &a, "a", "").expect("reg");

        assert!(tiler.rebalance("s", &window).expect("rebalance"));
        let leaves = vec![leaf_number(&a).expect("leaf"), leaf_number(&stray).expect("leaf")];
        assert_eq!(
            mux.last_layout(&window),
            layout_for_leaves(&leaves, 200, 50)
        );
    }

    #[test]
    fn narrow_window_zooms_after_layout() {
        let (mux, tiler, window) = setup(100, 60);
        let a = mux.add_pane("s", &window);
        let b = mux.add_pane("s", &window);
        tiler.registry().register("s", &window, &a, "a", "").expect("reg");
        tiler.registry().register("s", &window, &b, "b", "").expect("reg");

        assert!(tiler.rebalance("s", &window).expect("rebalance"));
        assert!(mux.is_zoomed("s", &window));
    }

    #[test]
    fn force_mobile_flag_toggles() {
        let (_mux, tiler, window) = setup(200, 50);
        assert!(!tiler.is_mobile("s", &window));
        tiler.set_force_mobile("s~1", true).expect("set");
        assert!(tiler.is_mobile("s", &window));
        tiler.set_force_mobile("s", false).expect("clear");
        assert!(!tiler.is_mobile("s", &window));
    }

    #[test]
    fn window_size_falls_back_to_grouped_session() {
        let (mux, tiler, window) = setup(200, 50);
        mux.set_window_size(&window, None);
        mux.add_grouped_session("s~1", &window, 150, 40);
        assert_eq!(tiler.window_size("s", &window), WindowSize::new(150, 40));
        assert_eq!(
            tiler.preferred_split_direction("s", &window),
            SplitDirection::Vertical
        );
    }

    #[test]
    fn check_user_modified_flags_unknown_live_pane() {
        let (mux, tiler, window) = setup(200, 50);
        let a = mux.add_pane("s", &window);
        let b = mux.add_pane("s", &window);
        tiler.registry().register("s", &window, &a, "a", "").expect("reg");
        tiler.registry().register("s", &window, &b, "b", "").expect("reg");
        assert!(!tiler.check_user_modified("s", &window).expect("check"));

        mux.add_pane("s", &window);
        assert!(tiler.check_user_modified("s", &window).expect("check"));
        assert!(tiler.registry().window("s", &window).expect("window").user_modified);
    }
}
