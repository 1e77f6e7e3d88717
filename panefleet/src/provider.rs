//! Collaborators the loop engine and watchdog depend on.
//!
//! [`PaneProvider`] gets or launches the agent pane for one loop iteration and
//! regenerates the instruction text that pane was given. [`SubjectProbe`]
//! answers questions about the task a loop works on. Both are narrow so the
//! host product can back them with its own task store.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::lifecycle::{LaunchRequest, Lifecycle, shell_quote};
use crate::looping::LoopKind;

/// How a loop iteration obtains its pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Replace any live pane for the task with a new one.
    Fresh,
    /// Keep a live pane for the task if there is one.
    Reuse,
}

#[derive(Debug, Clone)]
pub struct PaneRequest<'a> {
    pub task_id: &'a str,
    pub kind: LoopKind,
    pub iteration: u32,
    pub loop_id: &'a str,
    pub mode: LaunchMode,
}

/// A pane handed to a loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredPane {
    pub pane_id: String,
    pub window: String,
}

pub trait PaneProvider: Send + Sync {
    /// Get or launch the pane for this iteration.
    fn acquire_pane(&self, request: &PaneRequest<'_>) -> Result<AcquiredPane>;

    /// The instruction text the agent in this iteration's pane received.
    ///
    /// Must be deterministic: the loop regenerates it to recognise verdict
    /// keywords echoed back from the instructions.
    fn instruction_text(&self, request: &PaneRequest<'_>) -> String;
}

/// Where the task a loop works on stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectStatus {
    /// The task no longer exists.
    Missing,
    Active,
    /// The task reached a final state (merged, closed, ...).
    Terminal,
}

pub trait SubjectProbe: Send + Sync {
    fn status(&self, task_id: &str) -> SubjectStatus;

    /// Whether the window associated with `task_id` still exists.
    fn window_exists(&self, task_id: &str, window: &str) -> bool;
}

/// Substitute `{task}`, `{kind}`, `{iteration}` and `{loop_id}`.
pub fn render_template(template: &str, request: &PaneRequest<'_>) -> String {
    template
        .replace("{task}", request.task_id)
        .replace("{kind}", request.kind.as_str())
        .replace("{iteration}", &request.iteration.to_string())
        .replace("{loop_id}", request.loop_id)
}

/// [`PaneProvider`] that launches a command template through [`Lifecycle`].
///
/// Each task gets the role `<kind>-<task>` in one fixed window, so reuse goes
/// through the registry's find-or-launch. `{instruction}` in the command is
/// replaced by the shell-quoted rendered instruction.
pub struct CommandProvider {
    lifecycle: Arc<Lifecycle>,
    session: String,
    window: String,
    command: String,
    instruction: String,
}

impl CommandProvider {
    pub fn new(
        lifecycle: Arc<Lifecycle>,
        session: impl Into<String>,
        window: impl Into<String>,
        command: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            lifecycle,
            session: session.into(),
            window: window.into(),
            command: command.into(),
            instruction: instruction.into(),
        }
    }

    fn role(request: &PaneRequest<'_>) -> String {
        format!("{}-{}", request.kind.as_str(), request.task_id)
    }
}

impl PaneProvider for CommandProvider {
    fn acquire_pane(&self, request: &PaneRequest<'_>) -> Result<AcquiredPane> {
        let instruction = self.instruction_text(request);
        let cmd = render_template(&self.command, request)
            .replace("{instruction}", &shell_quote(&instruction));
        let role = Self::role(request);
        let launched = self.lifecycle.launch_pane(&LaunchRequest {
            session: &self.session,
            window: &self.window,
            role: &role,
            cmd: &cmd,
            fresh: request.mode == LaunchMode::Fresh,
        })?;
        debug!(pane_id = %launched.pane_id, created = launched.created, %role, "acquired pane");
        Ok(AcquiredPane {
            pane_id: launched.pane_id,
            window: self.window.clone(),
        })
    }

    fn instruction_text(&self, request: &PaneRequest<'_>) -> String {
        render_template(&self.instruction, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::LayoutSettings;
    use crate::io::store::MemoryStore;
    use crate::registry::PaneRegistry;
    use crate::test_support::FakeMux;
    use crate::tiling::Tiler;

    fn request(mode: LaunchMode) -> PaneRequest<'static> {
        PaneRequest {
            task_id: "pr-7",
            kind: LoopKind::Review,
            iteration: 3,
            loop_id: "beef",
            mode,
        }
    }

    #[test]
    fn renders_placeholders() {
        let text = render_template("{kind} {task} #{iteration} ({loop_id})", &request(LaunchMode::Fresh));
        assert_eq!(text, "review pr-7 #3 (beef)");
    }

    #[test]
    fn command_provider_reuses_or_replaces_task_pane() {
        let mux = Arc::new(FakeMux::new());
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(PaneRegistry::new(store.clone(), mux.clone()));
        let tiler = Arc::new(Tiler::new(mux.clone(), registry, store.clone(), LayoutSettings::default()));
        let lifecycle = Arc::new(Lifecycle::new(mux.clone(), tiler, store));
        let window = mux.add_window("s", 200, 50);
        mux.add_pane("s", &window);

        let provider = CommandProvider::new(
            lifecycle,
            "s",
            window.clone(),
            "agent --prompt {instruction}",
            "Review {task}, iteration {iteration}",
        );

        let first = provider.acquire_pane(&request(LaunchMode::Reuse)).expect("acquire");
        assert_eq!(first.window, window);
        let reused = provider.acquire_pane(&request(LaunchMode::Reuse)).expect("acquire");
        assert_eq!(reused, first);
        let fresh = provider.acquire_pane(&request(LaunchMode::Fresh)).expect("acquire");
        assert_ne!(fresh.pane_id, first.pane_id);

        assert!(
            mux.calls()
                .iter()
                .any(|c| c.contains("Review pr-7, iteration 3"))
        );
    }
}
