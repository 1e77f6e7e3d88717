//! Pane lifecycle events and find-or-launch.
//!
//! The multiplexer reports pane exits, closes, opens and window resizes through
//! hooks that invoke the `panefleet` binary. Each handler here keeps the
//! registry consistent with what is actually live and decides whether the
//! window needs a new layout.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{debug, error, info, instrument, warn};

use crate::core::types::{PaneEntry, SplitDirection, base_session_name};
use crate::io::config::LayoutSettings;
use crate::io::store::StateStore;
use crate::io::tmux::Multiplexer;
use crate::logging;
use crate::registry::PaneRegistry;
use crate::tiling::Tiler;

/// What [`Lifecycle::handle_pane_exited`] decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The event came from a previous incarnation of the session.
    Stale,
    /// Nothing registered was removed; the layout is untouched.
    NotRegistered,
    /// The window is user-modified; the pane was only unregistered.
    UnregisteredOnly,
    /// The pane was removed and the window needs a rebalance once it is gone.
    DeferredRebalance,
}

/// Summary of [`Lifecycle::handle_any_pane_closed`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClosedReport {
    /// `(session, window, removed pane ids)` for every window that changed.
    pub removed: Vec<(String, String, Vec<String>)>,
    /// New pane ids of respawned privileged panes.
    pub respawned: Vec<String>,
    /// `(session, window)` pairs that were rebalanced.
    pub rebalanced: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    pub session: &'a str,
    pub window: &'a str,
    pub role: &'a str,
    pub cmd: &'a str,
    /// Replace a live pane with the same role instead of focusing it.
    pub fresh: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub pane_id: String,
    /// False when an existing live pane was reused.
    pub created: bool,
}

/// Record name of the resize debounce marker for a window.
pub fn resize_marker_name(session: &str, window: &str) -> String {
    let window: String = window
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}.{window}.resize", base_session_name(session))
}

pub(crate) fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Wrap `cmd` so that its exit reports back to `hook pane-exited`.
pub fn exit_hook_command(
    hook: &str,
    session: &str,
    window: &str,
    generation: &str,
    cmd: &str,
) -> String {
    let trap = format!(
        "{hook} pane-exited {} {} {} \"$TMUX_PANE\"",
        shell_quote(session),
        shell_quote(window),
        shell_quote(generation)
    );
    let script = format!("trap {} EXIT; {cmd}", shell_quote(&trap));
    format!("bash -c {}", shell_quote(&script))
}

/// Global tmux hooks driving the hidden handlers: `(hook, window hook, arguments)`.
const HOOKS: [(&str, bool, &str); 3] = [
    ("after-kill-pane", false, "pane-closed"),
    (
        "after-split-window",
        true,
        r##"pane-opened "#{session_name}" "#{window_id}" "#{pane_id}""##,
    ),
    (
        "window-resized",
        true,
        r##"window-resized "#{session_name}" "#{window_id}""##,
    ),
];

/// The `run-shell` command a hook runs for `args`, logging to the hook log file.
pub fn hook_run_shell(hook: &str, args: &str) -> Result<String> {
    if hook.contains('\'') {
        bail!("hook command {hook:?} must not contain single quotes");
    }
    Ok(format!("run-shell '{}=1 {hook} {args}'", logging::LOG_FILE_ENV))
}

pub struct Lifecycle {
    mux: Arc<dyn Multiplexer>,
    registry: Arc<PaneRegistry>,
    tiler: Arc<Tiler>,
    store: Arc<dyn StateStore>,
    settings: LayoutSettings,
}

impl Lifecycle {
    pub fn new(mux: Arc<dyn Multiplexer>, tiler: Arc<Tiler>, store: Arc<dyn StateStore>) -> Self {
        Self {
            registry: tiler.registry().clone(),
            settings: tiler.settings().clone(),
            mux,
            tiler,
            store,
        }
    }

    pub fn tiler(&self) -> &Arc<Tiler> {
        &self.tiler
    }

    /// Register the global hooks that call back into the pane handlers.
    /// Returns the installed hook names.
    pub fn install_hooks(&self) -> Result<Vec<&'static str>> {
        let mut installed = Vec::with_capacity(HOOKS.len());
        for (hook, window_hook, args) in HOOKS {
            let command = hook_run_shell(&self.settings.hook_command, args)?;
            self.mux
                .set_hook(hook, window_hook, Some(&command))
                .with_context(|| format!("install {hook} hook"))?;
            debug!(hook, %command, "hook installed");
            installed.push(hook);
        }
        info!(hooks = installed.len(), "tmux hooks installed");
        Ok(installed)
    }

    /// A pane's exit hook fired.
    ///
    /// `generation` is the token the pane was launched under. The pane may
    /// still be live while this runs, so the rebalance is left to the caller
    /// (see [`Lifecycle::deferred_rebalance`]).
    #[instrument(skip(self))]
    pub fn handle_pane_exited(
        &self,
        session: &str,
        window: &str,
        generation: &str,
        pane_id: Option<&str>,
    ) -> Result<ExitOutcome> {
        let record = self.registry.load(session)?;
        if !record.generation.is_empty() && record.generation != generation {
            info!(current = %record.generation, "stale exit event, ignoring");
            return Ok(ExitOutcome::Stale);
        }

        let user_modified = record
            .windows
            .get(window)
            .is_some_and(|w| w.user_modified);
        if user_modified {
            if let Some(pane_id) = pane_id {
                self.registry.unregister(session, pane_id)?;
            }
            info!("window is user-modified, not rebalancing");
            return Ok(ExitOutcome::UnregisteredOnly);
        }

        match pane_id {
            Some(pane_id) => {
                if !self.registry.unregister(session, pane_id)? {
                    debug!("exited pane was not registered");
                    return Ok(ExitOutcome::NotRegistered);
                }
            }
            None => {
                if self.registry.reconcile(session, window)?.is_empty() {
                    debug!("reconcile removed nothing");
                    return Ok(ExitOutcome::NotRegistered);
                }
            }
        }

        if let Err(err) = self.mux.unzoom(session, window) {
            warn!(err = %format!("{err:#}"), "unzoom failed");
        }
        if pane_id.is_some()
            && let Err(err) = self.mux.select_last_pane(session, window)
        {
            warn!(err = %format!("{err:#}"), "could not move focus off exiting pane");
        }
        Ok(ExitOutcome::DeferredRebalance)
    }

    /// Wait until `pane_id` is gone, up to `timeout`. Returns whether it went away.
    pub fn await_pane_gone(&self, pane_id: &str, timeout: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.mux.pane_exists(pane_id) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(poll);
        }
    }

    /// Second half of exit handling, run detached from the dying pane.
    #[instrument(skip(self))]
    pub fn deferred_rebalance(
        &self,
        session: &str,
        window: &str,
        pane_id: Option<&str>,
    ) -> Result<bool> {
        if let Some(pane_id) = pane_id {
            let timeout = Duration::from_millis(self.settings.deferred_rebalance_timeout_ms);
            let poll = Duration::from_millis(self.settings.deferred_rebalance_poll_ms.max(1));
            if !self.await_pane_gone(pane_id, timeout, poll) {
                warn!(timeout_ms = timeout.as_millis() as u64, "pane still live after timeout, rebalancing anyway");
            }
        }
        self.tiler.rebalance(session, window)
    }

    /// A pane closed and nobody knows which: reconcile every registry.
    ///
    /// `current_session` is processed first so a killed privileged pane in the
    /// session the user is looking at comes back quickly.
    #[instrument(skip(self))]
    pub fn handle_any_pane_closed(&self, current_session: Option<&str>) -> Result<ClosedReport> {
        let mut sessions = self.registry.sessions()?;
        if let Some(current) = current_session.map(base_session_name)
            && let Some(pos) = sessions.iter().position(|s| s == current)
        {
            let current = sessions.remove(pos);
            sessions.insert(0, current);
        }

        let mut report = ClosedReport::default();
        for session in &sessions {
            if let Err(err) = self.process_closed(session, &mut report) {
                warn!(session, err = %format!("{err:#}"), "pane-closed handling failed");
            }
        }
        Ok(report)
    }

    fn process_closed(&self, session: &str, report: &mut ClosedReport) -> Result<()> {
        let record = self.registry.load(session)?;
        for (window, data) in &record.windows {
            let privileged: Vec<&PaneEntry> = data
                .panes
                .iter()
                .filter(|p| self.settings.privileged_roles.contains(&p.role))
                .collect();
            let removed = self.registry.reconcile(session, window)?;
            if removed.is_empty() {
                continue;
            }
            info!(session, window, ?removed, "reconciled after pane close");

            let killed: Vec<&PaneEntry> = privileged
                .into_iter()
                .filter(|p| removed.contains(&p.id))
                .collect();
            report
                .removed
                .push((session.to_string(), window.clone(), removed));

            if killed.is_empty() {
                if !data.user_modified {
                    self.tiler.rebalance(session, window)?;
                    report.rebalanced.push((session.to_string(), window.clone()));
                }
                continue;
            }

            let mut target_window = window.clone();
            for entry in killed {
                match self.respawn(session, window, entry) {
                    Ok((pane_id, new_window)) => {
                        report.respawned.push(pane_id);
                        target_window = new_window;
                    }
                    Err(err) => {
                        error!(session, window, role = %entry.role, err = %format!("{err:#}"), "respawn failed");
                    }
                }
            }
            self.tiler.rebalance(session, &target_window)?;
            report
                .rebalanced
                .push((session.to_string(), target_window));
        }
        Ok(())
    }

    /// Bring back a killed privileged pane. Returns `(pane_id, window)`.
    fn respawn(&self, session: &str, window: &str, entry: &PaneEntry) -> Result<(String, String)> {
        info!(session, window, role = %entry.role, "respawning privileged pane");
        let live = self.mux.list_panes(session, window)?;
        let (pane_id, window) = if live.is_empty() {
            let (pane_id, new_window) = self.mux.new_window(session, None, &entry.cmd)?;
            let viewer = self
                .mux
                .current_session()
                .filter(|s| base_session_name(s) == base_session_name(session))
                .unwrap_or_else(|| session.to_string());
            if let Err(err) = self.mux.select_window(&viewer, &new_window) {
                debug!(err = %format!("{err:#}"), "could not switch to respawned window");
            }
            (pane_id, new_window)
        } else {
            let target = format!("{session}:{window}");
            let pane_id = self
                .mux
                .split_pane(&target, SplitDirection::Horizontal, &entry.cmd, false)?;
            (pane_id, window.to_string())
        };
        let order = self
            .registry
            .register_first(session, &window, &pane_id, &entry.role, &entry.cmd)?;
        info!(%pane_id, %window, order, "respawned privileged pane");
        Ok((pane_id, window))
    }

    /// A pane appeared. Unknown panes mean a human split the window by hand.
    pub fn handle_pane_opened(&self, session: &str, window: &str, pane_id: &str) -> Result<bool> {
        if self.registry.window(session, window)?.contains(pane_id) {
            return Ok(false);
        }
        info!(session, window, pane_id, "unknown pane opened, marking window user-modified");
        self.registry.set_user_modified(session, window, true)?;
        Ok(true)
    }

    /// Debounced resize. Only the last handler to write the marker rebalances.
    #[instrument(skip(self))]
    pub fn handle_window_resized(&self, session: &str, window: &str, identity: &str) -> Result<bool> {
        if self.registry.window(session, window)?.panes.is_empty() {
            return Ok(false);
        }
        let marker = resize_marker_name(session, window);
        self.store.write(&marker, identity)?;
        thread::sleep(Duration::from_millis(self.settings.resize_debounce_ms));
        let latest = self.store.read(&marker)?;
        if latest.as_deref() != Some(identity) {
            debug!(?latest, "superseded by a newer resize");
            return Ok(false);
        }
        if let Err(err) = self.mux.unzoom(session, window) {
            warn!(err = %format!("{err:#}"), "unzoom failed");
        }
        self.tiler.rebalance(session, window)
    }

    /// Focus the live pane with `role`, or launch one.
    #[instrument(skip(self, request), fields(session = request.session, window = request.window, role = request.role, fresh = request.fresh))]
    pub fn launch_pane(&self, request: &LaunchRequest<'_>) -> Result<Launched> {
        let LaunchRequest {
            session,
            window,
            role,
            cmd,
            fresh,
        } = *request;

        if let Some(existing) = self.registry.find_live(session, role, Some(window))? {
            if !fresh {
                info!(pane_id = %existing, "pane already live, focusing");
                self.tiler.select_pane_smart(&existing, session, window)?;
                return Ok(Launched {
                    pane_id: existing,
                    created: false,
                });
            }
            info!(pane_id = %existing, "replacing live pane");
            self.registry.kill_and_unregister(session, &existing)?;
        }

        let generation = self.registry.generation(session)?;
        let wrapped = exit_hook_command(&self.settings.hook_command, session, window, &generation, cmd);
        let direction = self.tiler.preferred_split_direction(session, window);
        let target = format!("{session}:{window}");
        let pane_id = self.mux.split_pane(&target, direction, &wrapped, false)?;
        self.registry.register(session, window, &pane_id, role, cmd)?;
        // The split fires the pane-opened hook before registration; undo its flag.
        self.registry.set_user_modified(session, window, false)?;
        if let Err(err) = self.tiler.rebalance(session, window) {
            warn!(err = %format!("{err:#}"), "rebalance after launch failed");
        }
        info!(%pane_id, "launched pane");
        Ok(Launched {
            pane_id,
            created: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::store::MemoryStore;
    use crate::test_support::FakeMux;

    struct Fixture {
        mux: Arc<FakeMux>,
        store: Arc<MemoryStore>,
        lifecycle: Lifecycle,
        window: String,
    }

    fn fixture() -> Fixture {
        let mux = Arc::new(FakeMux::new());
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(PaneRegistry::new(store.clone(), mux.clone()));
        let settings = LayoutSettings {
            resize_debounce_ms: 1,
            deferred_rebalance_timeout_ms: 50,
            deferred_rebalance_poll_ms: 1,
            ..LayoutSettings::default()
        };
        let tiler = Arc::new(Tiler::new(mux.clone(), registry, store.clone(), settings));
        let lifecycle = Lifecycle::new(mux.clone(), tiler, store.clone());
        let window = mux.add_window("s", 200, 50);
        Fixture {
            mux,
            store,
            lifecycle,
            window,
        }
    }

    fn registry(f: &Fixture) -> &Arc<PaneRegistry> {
        f.lifecycle.tiler().registry()
    }

    #[test]
    fn exit_hook_wraps_command() {
        let wrapped = exit_hook_command("panefleet", "s", "@1", "g1", "echo 'hi'");
        assert!(wrapped.starts_with("bash -c '"));
        assert!(wrapped.contains("pane-exited"));
        assert!(wrapped.contains("TMUX_PANE"));
        assert!(wrapped.contains("g1"));
    }

    #[test]
    fn install_hooks_registers_handlers() {
        let f = fixture();
        let installed = f.lifecycle.install_hooks().expect("install");
        assert_eq!(installed, vec!["after-kill-pane", "after-split-window", "window-resized"]);

        let hooks = f.mux.hooks();
        assert_eq!(hooks["after-kill-pane"], "run-shell 'PANEFLEET_LOG_FILE=1 panefleet pane-closed'");
        assert_eq!(
            hooks["after-split-window"],
            r##"run-shell 'PANEFLEET_LOG_FILE=1 panefleet pane-opened "#{session_name}" "#{window_id}" "#{pane_id}"'"##
        );
        assert_eq!(
            hooks["window-resized"],
            r##"run-shell 'PANEFLEET_LOG_FILE=1 panefleet window-resized "#{session_name}" "#{window_id}"'"##
        );
        let calls = f.mux.calls();
        assert!(calls.iter().any(|c| c.starts_with("set-hook -g after-kill-pane ")));
        assert!(calls.iter().any(|c| c.starts_with("set-hook -gw after-split-window ")));
        assert!(calls.iter().any(|c| c.starts_with("set-hook -gw window-resized ")));
    }

    #[test]
    fn hook_command_with_single_quote_is_rejected() {
        assert!(hook_run_shell("/opt/it's/panefleet", "pane-closed").is_err());
    }

    #[test]
    fn stale_generation_is_ignored() {
        let f = fixture();
        let pane = f.mux.add_pane("s", &f.window);
        registry(&f).mint_generation("s").expect("mint");
        registry(&f).register("s", &f.window, &pane, "a", "").expect("reg");

        let outcome = f
            .lifecycle
            .handle_pane_exited("s", &f.window, "old-generation", Some(&pane))
            .expect("exit");
        assert_eq!(outcome, ExitOutcome::Stale);
        assert!(registry(&f).window("s", &f.window).expect("w").contains(&pane));
    }

    #[test]
    fn exit_unregisters_and_defers_rebalance() {
        let f = fixture();
        let a = f.mux.add_pane("s", &f.window);
        let b = f.mux.add_pane("s", &f.window);
        let generation = registry(&f).mint_generation("s").expect("mint");
        registry(&f).register("s", &f.window, &a, "a", "").expect("reg");
        registry(&f).register("s", &f.window, &b, "b", "").expect("reg");

        let outcome = f
            .lifecycle
            .handle_pane_exited("s", &f.window, &generation, Some(&b))
            .expect("exit");
        assert_eq!(outcome, ExitOutcome::DeferredRebalance);
        assert!(!registry(&f).window("s", &f.window).expect("w").contains(&b));

        f.mux.remove_pane(&b);
        assert!(f.lifecycle.deferred_rebalance("s", &f.window, Some(&b)).expect("rebalance"));
    }

    #[test]
    fn exit_on_user_modified_window_only_unregisters() {
        let f = fixture();
        let a = f.mux.add_pane("s", &f.window);
        registry(&f).register("s", &f.window, &a, "a", "").expect("reg");
        registry(&f).set_user_modified("s", &f.window, true).expect("flag");

        let outcome = f
            .lifecycle
            .handle_pane_exited("s", &f.window, "", Some(&a))
            .expect("exit");
        assert_eq!(outcome, ExitOutcome::UnregisteredOnly);
        assert!(registry(&f).window("s", &f.window).expect("w").panes.is_empty());
    }

    #[test]
    fn exit_for_unknown_pane_does_nothing() {
        let f = fixture();
        let outcome = f
            .lifecycle
            .handle_pane_exited("s", &f.window, "", Some("%404"))
            .expect("exit");
        assert_eq!(outcome, ExitOutcome::NotRegistered);
    }

    #[test]
    fn await_pane_gone_times_out_for_live_pane() {
        let f = fixture();
        let a = f.mux.add_pane("s", &f.window);
        assert!(!f.lifecycle.await_pane_gone(&a, Duration::from_millis(5), Duration::from_millis(1)));
        f.mux.remove_pane(&a);
        assert!(f.lifecycle.await_pane_gone(&a, Duration::from_millis(5), Duration::from_millis(1)));
    }

    #[test]
    fn closed_privileged_pane_is_respawned_first() {
        let f = fixture();
        let tui = f.mux.add_pane("s", &f.window);
        let agent = f.mux.add_pane("s", &f.window);
        registry(&f).register("s", &f.window, &tui, "tui", "run-tui").expect("reg");
        registry(&f).register("s", &f.window, &agent, "agent", "run-agent").expect("reg");
        registry(&f).set_user_modified("s", &f.window, true).expect("flag");

        f.mux.remove_pane(&tui);
        let report = f.lifecycle.handle_any_pane_closed(Some("s")).expect("closed");
        assert_eq!(report.respawned.len(), 1);

        let window = registry(&f).window("s", &f.window).expect("w");
        assert!(!window.user_modified);
        let first = &window.panes_by_order()[0];
        assert_eq!(first.role, "tui");
        assert_eq!(first.id, report.respawned[0]);
        assert!(first.order < 1);
        assert!(f.mux.calls().iter().any(|c| c.contains("run-tui")));
    }

    #[test]
    fn closed_ordinary_pane_rebalances_unless_user_modified() {
        let f = fixture();
        let a = f.mux.add_pane("s", &f.window);
        let b = f.mux.add_pane("s", &f.window);
        let c = f.mux.add_pane("s", &f.window);
        registry(&f).register("s", &f.window, &a, "a", "").expect("reg");
        registry(&f).register("s", &f.window, &b, "b", "").expect("reg");
        registry(&f).register("s", &f.window, &c, "c", "").expect("reg");

        f.mux.remove_pane(&b);
        let report = f.lifecycle.handle_any_pane_closed(None).expect("closed");
        assert_eq!(report.rebalanced, vec![("s".to_string(), f.window.clone())]);
        assert!(report.respawned.is_empty());
        assert!(f.mux.last_layout(&f.window).is_some());
    }

    #[test]
    fn unknown_opened_pane_marks_user_modified() {
        let f = fixture();
        let a = f.mux.add_pane("s", &f.window);
        registry(&f).register("s", &f.window, &a, "a", "").expect("reg");
        assert!(!f.lifecycle.handle_pane_opened("s", &f.window, &a).expect("opened"));
        assert!(f.lifecycle.handle_pane_opened("s", &f.window, "%500").expect("opened"));
        assert!(registry(&f).window("s", &f.window).expect("w").user_modified);
    }

    /// Store where another resize handler always wins the marker.
    struct RacingStore(MemoryStore);

    impl StateStore for RacingStore {
        fn read(&self, name: &str) -> Result<Option<String>> {
            self.0.read(name)
        }
        fn write(&self, name: &str, contents: &str) -> Result<()> {
            if name.ends_with(".resize") {
                return self.0.write(name, "newer");
            }
            self.0.write(name, contents)
        }
        fn remove(&self, name: &str) -> Result<bool> {
            self.0.remove(name)
        }
        fn list(&self, suffix: &str) -> Result<Vec<String>> {
            self.0.list(suffix)
        }
    }

    #[test]
    fn last_resize_wins_the_debounce() {
        let f = fixture();
        let a = f.mux.add_pane("s", &f.window);
        let b = f.mux.add_pane("s", &f.window);
        registry(&f).register("s", &f.window, &a, "a", "").expect("reg");
        registry(&f).register("s", &f.window, &b, "b", "").expect("reg");

        assert!(f.lifecycle.handle_window_resized("s", &f.window, "me").expect("resize"));
        assert_eq!(
            f.store.read(&resize_marker_name("s", &f.window)).expect("read"),
            Some("me".to_string())
        );
    }

    #[test]
    fn superseded_resize_does_not_rebalance() {
        let mux = Arc::new(FakeMux::new());
        let store: Arc<dyn StateStore> = Arc::new(RacingStore(MemoryStore::new()));
        let registry = Arc::new(PaneRegistry::new(store.clone(), mux.clone()));
        let settings = LayoutSettings {
            resize_debounce_ms: 1,
            ..LayoutSettings::default()
        };
        let tiler = Arc::new(Tiler::new(mux.clone(), registry.clone(), store.clone(), settings));
        let lifecycle = Lifecycle::new(mux.clone(), tiler, store);
        let window = mux.add_window("s", 200, 50);
        let a = mux.add_pane("s", &window);
        let b = mux.add_pane("s", &window);
        registry.register("s", &window, &a, "a", "").expect("reg");
        registry.register("s", &window, &b, "b", "").expect("reg");

        assert!(!lifecycle.handle_window_resized("s", &window, "me").expect("resize"));
        assert_eq!(mux.last_layout(&window), None);
    }

    #[test]
    fn resize_without_registered_panes_is_ignored() {
        let f = fixture();
        assert!(!f.lifecycle.handle_window_resized("s", &f.window, "me").expect("resize"));
    }

    #[test]
    fn launch_reuses_live_pane_then_replaces_when_fresh() {
        let f = fixture();
        f.mux.add_pane("s", &f.window);
        let request = LaunchRequest {
            session: "s",
            window: &f.window,
            role: "guide",
            cmd: "run-guide",
            fresh: false,
        };
        let first = f.lifecycle.launch_pane(&request).expect("launch");
        assert!(first.created);
        let again = f.lifecycle.launch_pane(&request).expect("launch");
        assert_eq!(again, Launched { pane_id: first.pane_id.clone(), created: false });

        let fresh = f
            .lifecycle
            .launch_pane(&LaunchRequest { fresh: true, ..request.clone() })
            .expect("launch");
        assert!(fresh.created);
        assert_ne!(fresh.pane_id, first.pane_id);
        assert!(!f.mux.pane_exists(&first.pane_id));
    }
}
