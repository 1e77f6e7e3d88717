//! Pane orchestration for agent sessions in tmux.
//!
//! The hidden subcommands are the entry points tmux hooks and pane exit traps
//! call; the rest are operator commands over the same library.

use std::path::PathBuf;
use std::process::{Command as ProcessCommand, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use panefleet::core::layout::compute_layout;
use panefleet::ids::short_id;
use panefleet::io::config::{Settings, home_dir, load_settings};
use panefleet::io::store::FsStore;
use panefleet::io::tmux::{Multiplexer, TmuxMultiplexer};
use panefleet::lifecycle::{ExitOutcome, LaunchRequest, Lifecycle};
use panefleet::logging;
use panefleet::registry::PaneRegistry;
use panefleet::tiling::Tiler;

#[derive(Parser)]
#[command(name = "panefleet", version, about = "Tiled tmux panes for agent sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the tiled layout string for a pane count and window size.
    Layout {
        panes: usize,
        width: u32,
        height: u32,
    },
    /// Reorder and re-tile a window's registered panes.
    Rebalance { session: String, window: String },
    /// Focus the live pane with a role, or launch it.
    Launch {
        #[arg(long)]
        session: String,
        #[arg(long)]
        window: String,
        #[arg(long)]
        role: String,
        /// Replace a live pane with the same role.
        #[arg(long)]
        fresh: bool,
        /// Command to run in the pane.
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },
    /// Start a new session incarnation; pending exit events of the old one are ignored.
    NewGeneration { session: String },
    /// Force mobile (single-column, zoomed) mode on or off.
    Mobile {
        session: String,
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
    /// Drop registry entries for panes and windows that no longer exist.
    Heal { session: String },
    /// Register the tmux hooks that keep panes tiled and respawned.
    InstallHooks,
    #[command(hide = true)]
    PaneExited {
        session: String,
        window: String,
        generation: String,
        pane: Option<String>,
    },
    #[command(hide = true)]
    DeferredRebalance {
        session: String,
        window: String,
        pane: Option<String>,
    },
    #[command(hide = true)]
    PaneOpened {
        session: String,
        window: String,
        pane: String,
    },
    #[command(hide = true)]
    PaneClosed {
        #[arg(long)]
        session: Option<String>,
    },
    #[command(hide = true)]
    WindowResized { session: String, window: String },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

struct App {
    mux: Arc<dyn Multiplexer>,
    lifecycle: Lifecycle,
}

impl App {
    fn open(home: PathBuf, settings: &Settings) -> Self {
        let mux: Arc<dyn Multiplexer> = Arc::new(TmuxMultiplexer::new(&settings.tmux));
        let store = Arc::new(FsStore::new(home.join("panes")));
        let registry = Arc::new(PaneRegistry::new(store.clone(), mux.clone()));
        let tiler = Arc::new(Tiler::new(
            mux.clone(),
            registry,
            store.clone(),
            settings.layout.clone(),
        ));
        let lifecycle = Lifecycle::new(mux.clone(), tiler, store);
        Self { mux, lifecycle }
    }

    fn registry(&self) -> &Arc<PaneRegistry> {
        self.lifecycle.tiler().registry()
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let home = home_dir()?;
    if std::env::var_os(logging::LOG_FILE_ENV).is_some_and(|v| !v.is_empty()) {
        logging::init_with_file(&home.join(logging::LOG_FILE_NAME))?;
    } else {
        logging::init();
    }
    let settings = load_settings(&home.join("config.toml"))?;

    if let Command::Layout {
        panes,
        width,
        height,
    } = cli.command
    {
        if panes == 0 || width == 0 || height == 0 {
            bail!("panes, width and height must all be positive");
        }
        println!("{}", compute_layout(panes, width, height));
        return Ok(());
    }

    let app = App::open(home, &settings);
    match cli.command {
        Command::Layout { .. } => Ok(()),
        Command::Rebalance { session, window } => {
            let applied = app.lifecycle.tiler().rebalance(&session, &window)?;
            if !applied {
                println!("nothing to rebalance");
            }
            Ok(())
        }
        Command::Launch {
            session,
            window,
            role,
            fresh,
            cmd,
        } => {
            let cmd = cmd.join(" ");
            let launched = app.lifecycle.launch_pane(&LaunchRequest {
                session: &session,
                window: &window,
                role: &role,
                cmd: &cmd,
                fresh,
            })?;
            println!("{}", launched.pane_id);
            Ok(())
        }
        Command::NewGeneration { session } => {
            println!("{}", app.registry().mint_generation(&session)?);
            Ok(())
        }
        Command::Mobile { session, state } => app
            .lifecycle
            .tiler()
            .set_force_mobile(&session, state == "on"),
        Command::Heal { session } => {
            let report = app.registry().heal(&session)?;
            println!(
                "removed {} panes, {} windows",
                report.removed_panes.len(),
                report.removed_windows.len()
            );
            Ok(())
        }
        Command::InstallHooks => {
            for hook in app.lifecycle.install_hooks()? {
                println!("{hook}");
            }
            Ok(())
        }
        Command::PaneExited {
            session,
            window,
            generation,
            pane,
        } => {
            let outcome =
                app.lifecycle
                    .handle_pane_exited(&session, &window, &generation, pane.as_deref())?;
            if outcome == ExitOutcome::DeferredRebalance {
                spawn_deferred_rebalance(&session, &window, pane.as_deref())?;
            }
            Ok(())
        }
        Command::DeferredRebalance {
            session,
            window,
            pane,
        } => {
            app.lifecycle
                .deferred_rebalance(&session, &window, pane.as_deref())?;
            Ok(())
        }
        Command::PaneOpened {
            session,
            window,
            pane,
        } => {
            app.lifecycle.handle_pane_opened(&session, &window, &pane)?;
            Ok(())
        }
        Command::PaneClosed { session } => {
            let current = session.or_else(|| app.mux.current_session());
            let report = app.lifecycle.handle_any_pane_closed(current.as_deref())?;
            info!(
                windows = report.removed.len(),
                respawned = report.respawned.len(),
                "pane-closed handled"
            );
            Ok(())
        }
        Command::WindowResized { session, window } => {
            let identity = format!("{}-{}", std::process::id(), short_id(6));
            app.lifecycle
                .handle_window_resized(&session, &window, &identity)?;
            Ok(())
        }
    }
}

/// Finish exit handling in a detached process so the dying pane's trap returns.
fn spawn_deferred_rebalance(session: &str, window: &str, pane: Option<&str>) -> Result<()> {
    let exe = std::env::current_exe().context("locate panefleet binary")?;
    let mut cmd = ProcessCommand::new(exe);
    cmd.arg("deferred-rebalance").arg(session).arg(window);
    if let Some(pane) = pane {
        cmd.arg(pane);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    match cmd.spawn() {
        Ok(child) => {
            info!(pid = child.id(), "deferred rebalance started");
            Ok(())
        }
        Err(err) => {
            warn!(err = %err, "could not detach deferred rebalance");
            Err(err).context("spawn deferred rebalance")
        }
    }
}
