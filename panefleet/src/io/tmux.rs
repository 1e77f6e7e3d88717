//! Multiplexer adapter.
//!
//! The [`Multiplexer`] trait is the narrow pane-controller surface the
//! orchestration layers depend on. [`TmuxMultiplexer`] drives the `tmux`
//! binary; tests use the in-memory fake from `test_support`.
//!
//! Queries follow tmux's own behaviour: an unknown session or window reads as
//! empty rather than as an error. Mutations return errors.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::core::types::{LivePane, SplitDirection, WindowInfo, WindowSize};
use crate::io::config::TmuxSettings;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Environment variable selecting a non-default tmux server socket.
pub const SOCKET_ENV: &str = "PANEFLEET_TMUX_SOCKET";

/// Pane-level operations on a terminal multiplexer.
pub trait Multiplexer: Send + Sync {
    /// Session of the pane this process runs in, if any.
    fn current_session(&self) -> Option<String>;

    /// Grouped sessions sharing windows with `base` (`base~1`, `base~2`, ...).
    fn grouped_sessions(&self, base: &str) -> Vec<String>;

    fn list_windows(&self, session: &str) -> Vec<WindowInfo>;

    fn window_exists(&self, session: &str, window: &str) -> bool {
        self.list_windows(session)
            .iter()
            .any(|w| w.id == window || w.index == window || w.name == window)
    }

    /// Live panes of a window in index order. Empty when the window is unknown.
    fn list_panes(&self, session: &str, window: &str) -> Result<Vec<LivePane>>;

    /// Size as reported through `session`. `None` when unknown or zero.
    fn window_size(&self, session: &str, window: &str) -> Option<WindowSize>;

    fn pane_exists(&self, pane_id: &str) -> bool;

    /// Visible text of a pane, including scrollback.
    fn capture_pane(&self, pane_id: &str) -> Result<String>;

    /// Split `target` and run `cmd` in the new pane. Returns the new pane id.
    fn split_pane(
        &self,
        target: &str,
        direction: SplitDirection,
        cmd: &str,
        background: bool,
    ) -> Result<String>;

    /// Create a window running `cmd`. Returns `(pane_id, window_id)`.
    fn new_window(&self, session: &str, name: Option<&str>, cmd: &str) -> Result<(String, String)>;

    fn kill_pane(&self, pane_id: &str) -> Result<()>;

    fn swap_panes(&self, source: &str, target: &str) -> Result<()>;

    fn apply_layout(&self, session: &str, window: &str, layout: &str) -> Result<()>;

    fn active_pane(&self, session: &str, window: &str) -> Option<String>;

    fn select_pane(&self, pane_id: &str) -> Result<()>;

    /// Focus the previously active pane, falling back to the next pane.
    fn select_last_pane(&self, session: &str, window: &str) -> Result<()>;

    fn select_window(&self, session: &str, window: &str) -> Result<()>;

    /// Toggle zoom on `pane_id`.
    fn zoom_pane(&self, pane_id: &str) -> Result<()>;

    fn is_zoomed(&self, session: &str, window: &str) -> bool;

    /// Set a global hook to run `command`, or remove it when `command` is `None`.
    /// `window_hook` selects window hooks such as `window-resized`.
    fn set_hook(&self, hook: &str, window_hook: bool, command: Option<&str>) -> Result<()>;

    /// Leave zoom if the window is zoomed.
    fn unzoom(&self, session: &str, window: &str) -> Result<()> {
        if self.is_zoomed(session, window)
            && let Some(active) = self.active_pane(session, window)
        {
            self.zoom_pane(&active)?;
        }
        Ok(())
    }
}

/// [`Multiplexer`] backed by the `tmux` command line.
#[derive(Debug, Clone)]
pub struct TmuxMultiplexer {
    socket: Option<PathBuf>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl TmuxMultiplexer {
    pub fn new(settings: &TmuxSettings) -> Self {
        Self {
            socket: std::env::var_os(SOCKET_ENV).map(PathBuf::from),
            timeout: Duration::from_millis(settings.command_timeout_ms),
            output_limit_bytes: settings.output_limit_bytes,
        }
    }

    pub fn with_socket(mut self, socket: impl Into<PathBuf>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("tmux");
        if let Some(socket) = &self.socket {
            cmd.arg("-S").arg(socket);
        }
        cmd.args(args);
        debug!(?args, "tmux");
        run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("tmux {}", args.first().copied().unwrap_or_default()))
    }

    /// Run a mutation; non-zero exit is an error.
    fn exec(&self, args: &[&str]) -> Result<String> {
        let label = format!("tmux {}", args.first().copied().unwrap_or_default());
        Ok(self.run(args)?.ensure_success(&label)?.stdout_text())
    }

    /// Run a query; any failure reads as `None`.
    fn query(&self, args: &[&str]) -> Option<String> {
        match self.run(args) {
            Ok(output) if output.success() => Some(output.stdout_text()),
            Ok(_) => None,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "tmux query failed");
                None
            }
        }
    }
}

fn window_target(session: &str, window: &str) -> String {
    format!("{session}:{window}")
}

/// Whether tmux's error output says the target or the whole server is gone.
fn reports_missing(stderr: &str) -> bool {
    ["can't find pane", "can't find window", "can't find session", "no server running", "error connecting to"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

pub(crate) fn hook_flags(window_hook: bool, unset: bool) -> &'static str {
    match (window_hook, unset) {
        (false, false) => "-g",
        (true, false) => "-gw",
        (false, true) => "-gu",
        (true, true) => "-gwu",
    }
}

fn split_flag(direction: SplitDirection) -> &'static str {
    match direction {
        SplitDirection::Horizontal => "-h",
        SplitDirection::Vertical => "-v",
    }
}

/// Parse `list-panes -F '#{pane_id} #{pane_index}'` output.
pub(crate) fn parse_pane_list(raw: &str) -> Vec<LivePane> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let index = parts.next()?.parse().ok()?;
            Some(LivePane {
                id: id.to_string(),
                index,
            })
        })
        .collect()
}

/// Parse `list-windows -F '#{window_id} #{window_index} #{window_name}'` output.
pub(crate) fn parse_window_list(raw: &str) -> Vec<WindowInfo> {
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ' ');
            Some(WindowInfo {
                id: parts.next()?.to_string(),
                index: parts.next()?.to_string(),
                name: parts.next()?.to_string(),
            })
        })
        .collect()
}

fn parse_size(raw: &str) -> Option<WindowSize> {
    let (w, h) = raw.trim().split_once(' ')?;
    WindowSize::new(w.parse().ok()?, h.parse().ok()?)
}

impl Multiplexer for TmuxMultiplexer {
    fn current_session(&self) -> Option<String> {
        std::env::var_os("TMUX")?;
        let name = match std::env::var("TMUX_PANE") {
            Ok(pane) => self.query(&["display-message", "-p", "-t", &pane, "#{session_name}"]),
            Err(_) => self.query(&["display-message", "-p", "#{session_name}"]),
        }?;
        (!name.is_empty()).then_some(name)
    }

    fn grouped_sessions(&self, base: &str) -> Vec<String> {
        let prefix = format!("{base}~");
        self.query(&["list-sessions", "-F", "#{session_name}"])
            .map(|raw| {
                raw.lines()
                    .filter(|name| name.starts_with(&prefix))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn list_windows(&self, session: &str) -> Vec<WindowInfo> {
        self.query(&[
            "list-windows",
            "-t",
            session,
            "-F",
            "#{window_id} #{window_index} #{window_name}",
        ])
        .map(|raw| parse_window_list(&raw))
        .unwrap_or_default()
    }

    fn list_panes(&self, session: &str, window: &str) -> Result<Vec<LivePane>> {
        let output = self.run(&[
            "list-panes",
            "-t",
            &window_target(session, window),
            "-F",
            "#{pane_id} #{pane_index}",
        ])?;
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(parse_pane_list(&output.stdout_text()))
    }

    fn window_size(&self, session: &str, window: &str) -> Option<WindowSize> {
        let raw = self.query(&[
            "display",
            "-t",
            &window_target(session, window),
            "-p",
            "#{window_width} #{window_height}",
        ])?;
        parse_size(&raw)
    }

    /// Only an answer saying the pane (or the server) is gone reads as gone;
    /// other failures keep the pane alive.
    fn pane_exists(&self, pane_id: &str) -> bool {
        match self.run(&["display", "-t", pane_id, "-p", "#{pane_id}"]) {
            Ok(output) if output.success() => output.stdout_text() == pane_id,
            Ok(output) => {
                let stderr = output.stderr_text();
                if reports_missing(&stderr) {
                    return false;
                }
                warn!(pane_id, %stderr, "pane lookup failed, assuming it is alive");
                true
            }
            Err(err) => {
                warn!(pane_id, err = %format!("{err:#}"), "pane lookup failed, assuming it is alive");
                true
            }
        }
    }

    fn capture_pane(&self, pane_id: &str) -> Result<String> {
        self.exec(&["capture-pane", "-p", "-J", "-S", "-", "-t", pane_id])
    }

    fn split_pane(
        &self,
        target: &str,
        direction: SplitDirection,
        cmd: &str,
        background: bool,
    ) -> Result<String> {
        let mut args = vec!["split-window", split_flag(direction)];
        if background {
            args.push("-d");
        }
        args.extend(["-t", target, "-P", "-F", "#{pane_id}", cmd]);
        let pane = self.exec(&args)?;
        if pane.is_empty() {
            bail!("tmux split-window returned no pane id");
        }
        Ok(pane)
    }

    fn new_window(&self, session: &str, name: Option<&str>, cmd: &str) -> Result<(String, String)> {
        let target = format!("{session}:");
        let mut args = vec!["new-window", "-d", "-t", &target, "-P", "-F", "#{pane_id} #{window_id}"];
        if let Some(name) = name {
            args.extend(["-n", name]);
        }
        args.push(cmd);
        let raw = self.exec(&args)?;
        match raw.split_once(' ') {
            Some((pane, window)) => Ok((pane.to_string(), window.to_string())),
            None => bail!("unexpected new-window output {raw:?}"),
        }
    }

    fn kill_pane(&self, pane_id: &str) -> Result<()> {
        self.exec(&["kill-pane", "-t", pane_id]).map(drop)
    }

    fn swap_panes(&self, source: &str, target: &str) -> Result<()> {
        self.exec(&["swap-pane", "-s", source, "-t", target, "-d"])
            .map(drop)
    }

    fn apply_layout(&self, session: &str, window: &str, layout: &str) -> Result<()> {
        self.exec(&["select-layout", "-t", &window_target(session, window), layout])
            .map(drop)
    }

    fn active_pane(&self, session: &str, window: &str) -> Option<String> {
        self.query(&["display", "-t", &window_target(session, window), "-p", "#{pane_id}"])
            .filter(|id| !id.is_empty())
    }

    fn select_pane(&self, pane_id: &str) -> Result<()> {
        self.exec(&["select-pane", "-t", pane_id]).map(drop)
    }

    fn select_last_pane(&self, session: &str, window: &str) -> Result<()> {
        let target = window_target(session, window);
        if self.query(&["select-pane", "-t", &target, "-l"]).is_some() {
            return Ok(());
        }
        self.exec(&["select-pane", "-t", &format!("{target}.+")])
            .map(drop)
    }

    fn select_window(&self, session: &str, window: &str) -> Result<()> {
        self.exec(&["select-window", "-t", &window_target(session, window)])
            .map(drop)
    }

    fn zoom_pane(&self, pane_id: &str) -> Result<()> {
        self.exec(&["resize-pane", "-t", pane_id, "-Z"]).map(drop)
    }

    fn is_zoomed(&self, session: &str, window: &str) -> bool {
        self.query(&[
            "display",
            "-t",
            &window_target(session, window),
            "-p",
            "#{window_zoomed_flag}",
        ])
        .is_some_and(|flag| flag == "1")
    }

    fn set_hook(&self, hook: &str, window_hook: bool, command: Option<&str>) -> Result<()> {
        let flags = hook_flags(window_hook, command.is_none());
        let mut args = vec!["set-hook", flags, hook];
        args.extend(command);
        self.exec(&args)?;
        Ok(())
    }
}
