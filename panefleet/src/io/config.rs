//! Settings stored under `<home>/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the state directory.
pub const HOME_ENV: &str = "PANEFLEET_HOME";

/// Panefleet settings (TOML).
///
/// Every section and field is optional; missing values take the defaults
/// below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub layout: LayoutSettings,
    pub idle: IdleSettings,
    pub verdict: VerdictSettings,
    pub loops: LoopSettings,
    pub watchdog: WatchdogSettings,
    pub tmux: TmuxSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LayoutSettings {
    /// Windows narrower than this many columns run in mobile mode.
    pub mobile_width_threshold: u32,
    /// How long a resize handler waits before checking it is still the latest.
    pub resize_debounce_ms: u64,
    /// Upper bound on waiting for an exiting pane to disappear.
    pub deferred_rebalance_timeout_ms: u64,
    pub deferred_rebalance_poll_ms: u64,
    /// Roles respawned automatically when their pane is killed.
    pub privileged_roles: Vec<String>,
    /// Program invoked by pane exit hooks.
    pub hook_command: String,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            mobile_width_threshold: 120,
            resize_debounce_ms: 150,
            deferred_rebalance_timeout_ms: 3_000,
            deferred_rebalance_poll_ms: 100,
            privileged_roles: vec!["tui".to_string()],
            hook_command: "panefleet".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IdleSettings {
    /// Seconds of unchanged content before a pane counts as idle.
    pub threshold_secs: u64,
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self { threshold_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerdictSettings {
    pub tail_lines: usize,
    pub stability_polls: u32,
    /// Absent polls tolerated before a pending verdict is forgotten.
    pub noise_tolerance: u32,
}

impl Default for VerdictSettings {
    fn default() -> Self {
        Self {
            tail_lines: crate::core::verdict::DEFAULT_TAIL_LINES,
            stability_polls: crate::core::verdict::DEFAULT_STABILITY_POLLS,
            noise_tolerance: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopSettings {
    /// Interval between content captures while waiting for a verdict.
    pub poll_interval_ms: u64,
    /// Granularity of liveness and cancellation checks inside waits.
    pub tick_ms: u64,
    /// Pause after a `READY` verdict before the next monitor iteration.
    pub iteration_wait_secs: u64,
    /// Verdicts are ignored this long after a monitor iteration starts.
    pub grace_period_secs: u64,
    pub review_max_iterations: u32,
    pub history_limit: usize,
    /// Delay between launching an agent pane and the first capture.
    pub launch_settle_ms: u64,
    /// Characters of pane output kept per history entry.
    pub output_keep_chars: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            tick_ms: 1_000,
            iteration_wait_secs: 120,
            grace_period_secs: 30,
            review_max_iterations: 10,
            history_limit: 50,
            launch_settle_ms: 2_000,
            output_keep_chars: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchdogSettings {
    pub interval_secs: u64,
    /// A poll timer silent for longer than this is presumed dead.
    pub poll_stale_ms: u64,
    pub poll_tick_ms: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            poll_stale_ms: 5_000,
            poll_tick_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TmuxSettings {
    pub command_timeout_ms: u64,
    pub output_limit_bytes: usize,
}

impl Default for TmuxSettings {
    fn default() -> Self {
        Self {
            command_timeout_ms: 5_000,
            output_limit_bytes: 2_000_000,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.verdict.stability_polls == 0 {
            return Err(anyhow!("verdict.stability_polls must be > 0"));
        }
        if self.verdict.tail_lines == 0 {
            return Err(anyhow!("verdict.tail_lines must be > 0"));
        }
        if self.loops.tick_ms == 0 || self.loops.poll_interval_ms == 0 {
            return Err(anyhow!("loops.tick_ms and loops.poll_interval_ms must be > 0"));
        }
        if self.watchdog.interval_secs == 0 || self.watchdog.poll_tick_ms == 0 {
            return Err(anyhow!("watchdog.interval_secs and watchdog.poll_tick_ms must be > 0"));
        }
        if self.watchdog.poll_stale_ms <= self.watchdog.poll_tick_ms {
            return Err(anyhow!("watchdog.poll_stale_ms must exceed watchdog.poll_tick_ms"));
        }
        if self.tmux.command_timeout_ms == 0 {
            return Err(anyhow!("tmux.command_timeout_ms must be > 0"));
        }
        if self.layout.hook_command.trim().is_empty() {
            return Err(anyhow!("layout.hook_command must be non-empty"));
        }
        Ok(())
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle.threshold_secs)
    }
}

/// State directory: `$PANEFLEET_HOME`, else `$HOME/.panefleet`.
pub fn home_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }
    let home = std::env::var_os("HOME").context("neither PANEFLEET_HOME nor HOME is set")?;
    Ok(PathBuf::from(home).join(".panefleet"))
}

/// Load settings from a TOML file.
///
/// If the file is missing, returns `Settings::default()`.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        let settings = Settings::default();
        settings.validate()?;
        return Ok(settings);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

/// Atomically write settings to disk (temp file + rename).
#[cfg(any(test, feature = "test-support"))]
pub fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
    settings.validate()?;
    let mut buf = toml::to_string_pretty(settings).context("serialize settings toml")?;
    buf.push('\n');
    crate::io::store::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut settings = Settings::default();
        settings.verdict.noise_tolerance = 2;
        settings.layout.privileged_roles = vec!["tui".to_string(), "guide".to_string()];
        write_settings(&path, &settings).expect("write");
        assert_eq!(load_settings(&path).expect("load"), settings);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[idle]\nthreshold_secs = 5\n").expect("write");
        let settings = load_settings(&path).expect("load");
        assert_eq!(settings.idle.threshold_secs, 5);
        assert_eq!(settings.layout, LayoutSettings::default());
    }

    #[test]
    fn rejects_zero_stability_polls() {
        let mut settings = Settings::default();
        settings.verdict.stability_polls = 0;
        assert!(settings.validate().is_err());
    }
}
