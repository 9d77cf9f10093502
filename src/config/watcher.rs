//! Notify-based policy file change feed.
//!
//! - Watches the directory holding the policy file using notify::RecommendedWatcher,
//!   so editors that replace the file on save are still seen.
//! - On create/modify events for that file, wakes the policy syncer for an immediate resync.

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// Watch the policy file and poke `trigger` whenever it changes.
///
/// The syncer does the actual reload, so a broken edit is rejected by the
/// same path as a broken periodic fetch and the previous snapshot stays.
pub async fn watch_policy_file(path: PathBuf, trigger: Arc<Notify>) -> Result<(), notify::Error> {
    // Bridges the sync watcher thread to this task.
    let (tx, mut rx) = mpsc::channel(16);

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Err(e) = tx.blocking_send(res) {
                debug!("Failed to send policy file event: {}", e);
            }
        },
        notify::Config::default(),
    )?;

    let dir = watch_dir(&path);
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!("Watching policy file for changes: {}", path.display());

    while let Some(res) = rx.recv().await {
        match res {
            Ok(event) => {
                if should_reload(&event, &path) {
                    info!(
                        "Policy file change detected. Event: {:?}. Triggering resync.",
                        event.kind
                    );
                    crate::metrics::record_policy_reload_trigger(true);
                    trigger.notify_one();
                } else {
                    debug!("Ignoring irrelevant filesystem event: {:?}", event.kind);
                }
            }
            Err(e) => {
                crate::metrics::record_policy_reload_trigger(false);
                error!("Error watching policy file: {}", e);
            }
        }
    }

    warn!("Policy file watcher is shutting down.");
    Ok(())
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Modifications and creations of the watched file itself.
fn should_reload(event: &Event, path: &Path) -> bool {
    let relevant_kind = matches!(
        event.kind,
        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
    );
    relevant_kind
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some() && p.file_name() == path.file_name())
}
