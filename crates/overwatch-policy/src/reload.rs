//! Policy hot-reload.
//!
//! Watches one policy file with `notify`, debounces bursts of filesystem
//! events, re-parses and validates, and applies the new set through the
//! engine's normal load path (a failed load keeps the previous set active).
//! Reload outcomes are broadcast on a `tokio::sync::watch` channel.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;
use tracing::{info, warn};

use overwatch_types::config::ValidationIssue;
use overwatch_types::errors::OverwatchError;

use crate::engine::PolicyEngine;

/// Default debounce window for filesystem event bursts.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Outcome of the most recent reload attempt.
#[derive(Debug, Clone)]
pub enum ReloadEvent {
    /// No reload has fired yet.
    Initial,
    /// A new set was applied; carries any validation warnings.
    Reloaded { warnings: Vec<ValidationIssue> },
    /// The file changed but the new set was rejected; the previous set stays
    /// active.
    Failed { error: String },
}

/// Keeps the file watch alive. Dropping this stops the watcher thread and
/// releases the engine reference, so a forgotten watcher never pins the
/// process open.
pub struct PolicyWatcher {
    _watcher: RecommendedWatcher,
}

/// Watch `path` and hot-reload the engine on change.
///
/// Returns the watcher guard and a receiver for reload outcomes.
pub fn watch_policy_file(
    engine: Arc<PolicyEngine>,
    path: &Path,
    debounce: Duration,
) -> Result<(PolicyWatcher, watch::Receiver<ReloadEvent>), OverwatchError> {
    let (event_tx, event_rx) = mpsc::channel::<()>();
    let (reload_tx, reload_rx) = watch::channel(ReloadEvent::Initial);

    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        match res {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    let _ = event_tx.send(());
                }
            }
            Err(e) => {
                warn!(error = %e, "policy file watcher error");
            }
        }
    })
    .map_err(|e| OverwatchError::Config(format!("failed to create policy watcher: {e}")))?;

    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .map_err(|e| {
            OverwatchError::Config(format!("failed to watch {}: {e}", path.display()))
        })?;

    // Debounce thread: collapse event bursts, then reload. Exits when the
    // watcher (and with it the sender) is dropped.
    let reload_path: PathBuf = path.to_path_buf();
    std::thread::spawn(move || {
        while event_rx.recv().is_ok() {
            // Absorb further events until the window stays quiet.
            while event_rx.recv_timeout(debounce).is_ok() {}
            match engine.reload_from_path(&reload_path) {
                Ok(warnings) => {
                    info!(path = %reload_path.display(), "policy hot-reloaded");
                    let _ = reload_tx.send(ReloadEvent::Reloaded { warnings });
                }
                Err(e) => {
                    warn!(
                        path = %reload_path.display(),
                        error = %e,
                        "policy reload failed, keeping previous set"
                    );
                    let _ = reload_tx.send(ReloadEvent::Failed {
                        error: e.to_string(),
                    });
                }
            }
        }
    });

    info!(path = %path.display(), "watching policy file for changes");
    Ok((PolicyWatcher { _watcher: watcher }, reload_rx))
}
