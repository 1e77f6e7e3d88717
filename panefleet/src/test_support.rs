//! Test-only fakes: an in-memory multiplexer, a manual clock and scripted
//! collaborators for the loop engine.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};

use crate::core::types::{LivePane, SplitDirection, WindowInfo, WindowSize, base_session_name};
use crate::idle::Clock;
use crate::io::store::FsStore;
use crate::io::tmux::{Multiplexer, hook_flags};
use crate::provider::{
    AcquiredPane, LaunchMode, PaneProvider, PaneRequest, SubjectProbe, SubjectStatus,
};
use crate::sync::lock;

/// [`FsStore`] in a fresh temporary directory, removed when the guard drops.
pub fn temp_fs_store() -> Result<(tempfile::TempDir, Arc<FsStore>)> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(FsStore::new(dir.path().join("panes")));
    Ok((dir, store))
}

#[derive(Debug, Clone)]
struct FakeWindow {
    id: String,
    session: String,
    name: String,
    panes: Vec<String>,
    size: Option<WindowSize>,
    layout: Option<String>,
    zoomed: bool,
    active: Option<String>,
    last_active: Option<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    next_window: u32,
    next_pane: u32,
    windows: Vec<FakeWindow>,
    contents: HashMap<String, String>,
    frames: HashMap<String, VecDeque<String>>,
    failing_captures: HashSet<String>,
    grouped: Vec<(String, String, WindowSize)>,
    current: Option<String>,
    calls: Vec<String>,
    hooks: BTreeMap<String, String>,
}

impl FakeState {
    fn window(&self, window: &str) -> Option<&FakeWindow> {
        self.windows.iter().find(|w| w.id == window)
    }

    fn window_mut(&mut self, window: &str) -> Option<&mut FakeWindow> {
        self.windows.iter_mut().find(|w| w.id == window)
    }

    fn window_of_pane_mut(&mut self, pane_id: &str) -> Option<&mut FakeWindow> {
        self.windows
            .iter_mut()
            .find(|w| w.panes.iter().any(|p| p == pane_id))
    }

    /// Window as seen through `session` (a base or grouped session name).
    fn visible_window(&self, session: &str, window: &str) -> Option<&FakeWindow> {
        self.window(window)
            .filter(|w| base_session_name(&w.session) == base_session_name(session))
    }

    fn new_window(&mut self, session: &str, size: Option<WindowSize>) -> String {
        self.next_window += 1;
        let id = format!("@{}", self.next_window);
        self.windows.push(FakeWindow {
            id: id.clone(),
            session: session.to_string(),
            name: format!("win{}", self.next_window),
            panes: Vec::new(),
            size,
            layout: None,
            zoomed: false,
            active: None,
            last_active: None,
        });
        id
    }

    fn new_pane(&mut self, session: &str, window: &str, activate: bool) -> String {
        self.next_pane += 1;
        let pane = format!("%{}", self.next_pane);
        if self.window(window).is_none() {
            self.windows.push(FakeWindow {
                id: window.to_string(),
                session: session.to_string(),
                name: window.to_string(),
                panes: Vec::new(),
                size: WindowSize::new(200, 50),
                layout: None,
                zoomed: false,
                active: None,
                last_active: None,
            });
        }
        if let Some(w) = self.window_mut(window) {
            w.panes.push(pane.clone());
            if activate || w.active.is_none() {
                w.last_active = w.active.take();
                w.active = Some(pane.clone());
            }
        }
        pane
    }

    fn remove_pane(&mut self, pane_id: &str) -> bool {
        let Some(window) = self.window_of_pane_mut(pane_id) else {
            return false;
        };
        window.panes.retain(|p| p != pane_id);
        if window.active.as_deref() == Some(pane_id) {
            window.active = window
                .last_active
                .take()
                .filter(|p| window.panes.contains(p))
                .or_else(|| window.panes.first().cloned());
        }
        let window_id = window.id.clone();
        if window.panes.is_empty() {
            self.windows.retain(|w| w.id != window_id);
        }
        self.contents.remove(pane_id);
        self.frames.remove(pane_id);
        true
    }
}

/// In-memory [`Multiplexer`].
///
/// Window ids are `@N` and pane ids `%N`. Removing a window's last pane
/// removes the window, as tmux does. Mutating calls are recorded.
#[derive(Debug, Default)]
pub struct FakeMux {
    state: Mutex<FakeState>,
}

impl FakeMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_window(&self, session: &str, width: u32, height: u32) -> String {
        lock(&self.state).new_window(session, WindowSize::new(width, height))
    }

    /// Add a pane to `window`, creating the window if it does not exist.
    pub fn add_pane(&self, session: &str, window: &str) -> String {
        lock(&self.state).new_pane(session, window, true)
    }

    /// Kill a pane behind the orchestrator's back.
    pub fn remove_pane(&self, pane_id: &str) {
        lock(&self.state).remove_pane(pane_id);
    }

    pub fn remove_window(&self, session: &str, window: &str) {
        let mut state = lock(&self.state);
        let panes: Vec<String> = state
            .visible_window(session, window)
            .map(|w| w.panes.clone())
            .unwrap_or_default();
        for pane in panes {
            state.remove_pane(&pane);
        }
        state.windows.retain(|w| w.id != window);
    }

    pub fn set_window_size(&self, window: &str, size: Option<WindowSize>) {
        if let Some(w) = lock(&self.state).window_mut(window) {
            w.size = size;
        }
    }

    /// A grouped session viewing `window` at its own size.
    pub fn add_grouped_session(&self, name: &str, window: &str, width: u32, height: u32) {
        if let Some(size) = WindowSize::new(width, height) {
            lock(&self.state)
                .grouped
                .push((name.to_string(), window.to_string(), size));
        }
    }

    pub fn set_current_session(&self, session: Option<&str>) {
        lock(&self.state).current = session.map(str::to_string);
    }

    /// Fixed content returned by every capture of `pane_id`.
    pub fn set_content(&self, pane_id: &str, content: &str) {
        let mut state = lock(&self.state);
        state.frames.remove(pane_id);
        state
            .contents
            .insert(pane_id.to_string(), content.to_string());
    }

    /// Captures return `frames` in order; the last frame repeats.
    pub fn script_captures(&self, pane_id: &str, frames: Vec<String>) {
        lock(&self.state)
            .frames
            .insert(pane_id.to_string(), frames.into());
    }

    /// Make every capture of `pane_id` fail (or succeed again).
    pub fn fail_captures(&self, pane_id: &str, failing: bool) {
        let mut state = lock(&self.state);
        if failing {
            state.failing_captures.insert(pane_id.to_string());
        } else {
            state.failing_captures.remove(pane_id);
        }
    }

    /// Live pane ids of `window` in index order.
    pub fn pane_order(&self, window: &str) -> Vec<String> {
        lock(&self.state)
            .window(window)
            .map(|w| w.panes.clone())
            .unwrap_or_default()
    }

    pub fn last_layout(&self, window: &str) -> Option<String> {
        lock(&self.state).window(window).and_then(|w| w.layout.clone())
    }

    pub fn windows(&self, session: &str) -> Vec<String> {
        lock(&self.state)
            .windows
            .iter()
            .filter(|w| base_session_name(&w.session) == base_session_name(session))
            .map(|w| w.id.clone())
            .collect()
    }

    /// Installed global hooks by name.
    pub fn hooks(&self) -> BTreeMap<String, String> {
        lock(&self.state).hooks.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    fn record(&self, call: String) {
        lock(&self.state).calls.push(call);
    }
}

fn split_target(target: &str) -> (&str, &str) {
    target.split_once(':').unwrap_or(("", target))
}

impl Multiplexer for FakeMux {
    fn current_session(&self) -> Option<String> {
        lock(&self.state).current.clone()
    }

    fn grouped_sessions(&self, base: &str) -> Vec<String> {
        let prefix = format!("{base}~");
        let mut names: Vec<String> = lock(&self.state)
            .grouped
            .iter()
            .map(|(name, _, _)| name.clone())
            .filter(|name| name.starts_with(&prefix))
            .collect();
        names.dedup();
        names
    }

    fn list_windows(&self, session: &str) -> Vec<WindowInfo> {
        lock(&self.state)
            .windows
            .iter()
            .filter(|w| base_session_name(&w.session) == base_session_name(session))
            .enumerate()
            .map(|(index, w)| WindowInfo {
                id: w.id.clone(),
                index: index.to_string(),
                name: w.name.clone(),
            })
            .collect()
    }

    fn list_panes(&self, session: &str, window: &str) -> Result<Vec<LivePane>> {
        Ok(lock(&self.state)
            .visible_window(session, window)
            .map(|w| {
                w.panes
                    .iter()
                    .enumerate()
                    .map(|(index, id)| LivePane {
                        id: id.clone(),
                        index: index as u32,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn window_size(&self, session: &str, window: &str) -> Option<WindowSize> {
        let state = lock(&self.state);
        let w = state.window(window)?;
        if w.session == session {
            return w.size;
        }
        state
            .grouped
            .iter()
            .find(|(name, win, _)| name == session && win == window)
            .map(|(_, _, size)| *size)
    }

    fn pane_exists(&self, pane_id: &str) -> bool {
        lock(&self.state)
            .windows
            .iter()
            .any(|w| w.panes.iter().any(|p| p == pane_id))
    }

    fn capture_pane(&self, pane_id: &str) -> Result<String> {
        let mut state = lock(&self.state);
        if !state.windows.iter().any(|w| w.panes.iter().any(|p| p == pane_id)) {
            bail!("can't find pane: {pane_id}");
        }
        if state.failing_captures.contains(pane_id) {
            bail!("capture of {pane_id} failed");
        }
        if let Some(frames) = state.frames.get_mut(pane_id)
            && let Some(front) = frames.front().cloned()
        {
            if frames.len() > 1 {
                frames.pop_front();
            }
            return Ok(front);
        }
        Ok(state.contents.get(pane_id).cloned().unwrap_or_default())
    }

    fn split_pane(
        &self,
        target: &str,
        direction: SplitDirection,
        cmd: &str,
        background: bool,
    ) -> Result<String> {
        self.record(format!("split-window {} {target} {cmd}", direction.as_str()));
        let mut state = lock(&self.state);
        let (session, window) = if target.starts_with('%') {
            let w = state
                .windows
                .iter()
                .find(|w| w.panes.iter().any(|p| p == target))
                .ok_or_else(|| anyhow!("can't find pane: {target}"))?;
            (w.session.clone(), w.id.clone())
        } else {
            let (session, window) = split_target(target);
            let w = state
                .visible_window(session, window)
                .ok_or_else(|| anyhow!("can't find window: {target}"))?;
            (w.session.clone(), w.id.clone())
        };
        Ok(state.new_pane(&session, &window, !background))
    }

    fn new_window(&self, session: &str, name: Option<&str>, cmd: &str) -> Result<(String, String)> {
        self.record(format!("new-window {session} {cmd}"));
        let mut state = lock(&self.state);
        let window = state.new_window(session, WindowSize::new(200, 50));
        if let Some(name) = name
            && let Some(w) = state.window_mut(&window)
        {
            w.name = name.to_string();
        }
        let pane = state.new_pane(session, &window, true);
        Ok((pane, window))
    }

    fn kill_pane(&self, pane_id: &str) -> Result<()> {
        self.record(format!("kill-pane {pane_id}"));
        if lock(&self.state).remove_pane(pane_id) {
            Ok(())
        } else {
            bail!("can't find pane: {pane_id}")
        }
    }

    fn swap_panes(&self, source: &str, target: &str) -> Result<()> {
        self.record(format!("swap-pane {source} {target}"));
        let mut state = lock(&self.state);
        let window = state
            .window_of_pane_mut(source)
            .ok_or_else(|| anyhow!("can't find pane: {source}"))?;
        let a = window.panes.iter().position(|p| p == source);
        let b = window.panes.iter().position(|p| p == target);
        match (a, b) {
            (Some(a), Some(b)) => {
                window.panes.swap(a, b);
                Ok(())
            }
            _ => bail!("can't swap {source} with {target}"),
        }
    }

    fn apply_layout(&self, session: &str, window: &str, layout: &str) -> Result<()> {
        self.record(format!("select-layout {session}:{window} {layout}"));
        let mut state = lock(&self.state);
        let w = state
            .window_mut(window)
            .ok_or_else(|| anyhow!("can't find window: {window}"))?;
        w.layout = Some(layout.to_string());
        w.zoomed = false;
        Ok(())
    }

    fn active_pane(&self, session: &str, window: &str) -> Option<String> {
        lock(&self.state)
            .visible_window(session, window)
            .and_then(|w| w.active.clone().or_else(|| w.panes.first().cloned()))
    }

    fn select_pane(&self, pane_id: &str) -> Result<()> {
        self.record(format!("select-pane {pane_id}"));
        let mut state = lock(&self.state);
        let window = state
            .window_of_pane_mut(pane_id)
            .ok_or_else(|| anyhow!("can't find pane: {pane_id}"))?;
        if window.active.as_deref() != Some(pane_id) {
            window.last_active = window.active.replace(pane_id.to_string());
        }
        Ok(())
    }

    fn select_last_pane(&self, session: &str, window: &str) -> Result<()> {
        self.record(format!("select-pane -l {session}:{window}"));
        let mut state = lock(&self.state);
        let w = state
            .window_mut(window)
            .ok_or_else(|| anyhow!("can't find window: {window}"))?;
        let next = w
            .last_active
            .clone()
            .filter(|p| w.panes.contains(p))
            .or_else(|| {
                let current = w.active.as_ref()?;
                let index = w.panes.iter().position(|p| p == current)?;
                w.panes.get((index + 1) % w.panes.len()).cloned()
            });
        if let Some(next) = next {
            w.last_active = w.active.replace(next);
        }
        Ok(())
    }

    fn select_window(&self, session: &str, window: &str) -> Result<()> {
        self.record(format!("select-window {session}:{window}"));
        Ok(())
    }

    fn zoom_pane(&self, pane_id: &str) -> Result<()> {
        self.record(format!("zoom {pane_id}"));
        let mut state = lock(&self.state);
        let window = state
            .window_of_pane_mut(pane_id)
            .ok_or_else(|| anyhow!("can't find pane: {pane_id}"))?;
        window.zoomed = !window.zoomed;
        window.active = Some(pane_id.to_string());
        Ok(())
    }

    fn is_zoomed(&self, session: &str, window: &str) -> bool {
        lock(&self.state)
            .visible_window(session, window)
            .is_some_and(|w| w.zoomed)
    }

    fn set_hook(&self, hook: &str, window_hook: bool, command: Option<&str>) -> Result<()> {
        let flags = hook_flags(window_hook, command.is_none());
        let mut state = lock(&self.state);
        match command {
            Some(command) => {
                state.calls.push(format!("set-hook {flags} {hook} {command}"));
                state.hooks.insert(hook.to_string(), command.to_string());
            }
            None => {
                state.calls.push(format!("set-hook {flags} {hook}"));
                state.hooks.remove(hook);
            }
        }
        Ok(())
    }
}

/// [`Clock`] advanced by hand.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.now) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *lock(&self.now)
    }
}

/// What the next pane handed out by [`ScriptedProvider`] does.
#[derive(Debug, Clone)]
pub enum PaneScript {
    /// Captures return these frames in order, the last one repeating.
    Frames(Vec<String>),
    /// The pane disappears right after launch.
    Vanish,
    /// Launching fails.
    FailLaunch,
    /// Launching panics, taking the worker thread down.
    Panic,
}

impl PaneScript {
    pub fn frames(frames: &[&str]) -> Self {
        PaneScript::Frames(frames.iter().map(|f| f.to_string()).collect())
    }
}

/// [`PaneProvider`] over a [`FakeMux`] that plays one [`PaneScript`] per acquisition.
pub struct ScriptedProvider {
    mux: Arc<FakeMux>,
    session: String,
    window: String,
    scripts: Mutex<VecDeque<PaneScript>>,
    panes: Mutex<HashMap<String, String>>,
    requests: Mutex<Vec<(String, u32, LaunchMode)>>,
}

impl ScriptedProvider {
    /// Creates a window in `session` with one host pane that keeps it alive.
    pub fn new(mux: Arc<FakeMux>, session: &str) -> Self {
        let window = mux.add_window(session, 200, 50);
        mux.add_pane(session, &window);
        Self {
            mux,
            session: session.to_string(),
            window,
            scripts: Mutex::new(VecDeque::new()),
            panes: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn window(&self) -> &str {
        &self.window
    }

    pub fn push(&self, script: PaneScript) {
        lock(&self.scripts).push_back(script);
    }

    /// `(task, iteration, mode)` of every acquisition so far.
    pub fn requests(&self) -> Vec<(String, u32, LaunchMode)> {
        lock(&self.requests).clone()
    }

    pub fn current_pane(&self, task_id: &str) -> Option<String> {
        lock(&self.panes).get(task_id).cloned()
    }
}

impl PaneProvider for ScriptedProvider {
    fn acquire_pane(&self, request: &PaneRequest<'_>) -> Result<AcquiredPane> {
        lock(&self.requests).push((request.task_id.to_string(), request.iteration, request.mode));
        let script = lock(&self.scripts).pop_front();
        match script {
            Some(PaneScript::FailLaunch) => bail!("agent failed to launch"),
            Some(PaneScript::Panic) => panic!("provider crashed"),
            _ => {}
        }

        let mut panes = lock(&self.panes);
        let existing = panes
            .get(request.task_id)
            .filter(|p| self.mux.pane_exists(p))
            .cloned();
        let pane_id = match (existing, request.mode) {
            (Some(pane), LaunchMode::Reuse) => pane,
            (existing, _) => {
                if let Some(old) = existing {
                    self.mux.remove_pane(&old);
                }
                self.mux.add_pane(&self.session, &self.window)
            }
        };
        match script {
            Some(PaneScript::Frames(frames)) => self.mux.script_captures(&pane_id, frames),
            Some(PaneScript::Vanish) => self.mux.remove_pane(&pane_id),
            Some(PaneScript::FailLaunch | PaneScript::Panic) | None => {}
        }
        panes.insert(request.task_id.to_string(), pane_id.clone());
        Ok(AcquiredPane {
            pane_id,
            window: self.window.clone(),
        })
    }

    fn instruction_text(&self, request: &PaneRequest<'_>) -> String {
        format!(
            "{} {} iteration {}: finish with a verdict line",
            request.kind.as_str(),
            request.task_id,
            request.iteration
        )
    }
}

/// [`SubjectProbe`] with per-task answers. Unknown tasks are active.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    statuses: Mutex<HashMap<String, SubjectStatus>>,
    missing_windows: Mutex<HashSet<String>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, task_id: &str, status: SubjectStatus) {
        lock(&self.statuses).insert(task_id.to_string(), status);
    }

    pub fn close_window(&self, window: &str) {
        lock(&self.missing_windows).insert(window.to_string());
    }
}

impl SubjectProbe for ScriptedProbe {
    fn status(&self, task_id: &str) -> SubjectStatus {
        lock(&self.statuses)
            .get(task_id)
            .copied()
            .unwrap_or(SubjectStatus::Active)
    }

    fn window_exists(&self, _task_id: &str, window: &str) -> bool {
        !lock(&self.missing_windows).contains(window)
    }
}
