//! Image-store watch: when a `manifest.json` is renamed into place under a
//! per-type subdirectory, broadcast `new_manifest` to every hub connection.
//! The notify callback runs on the watcher's own thread and only hands the
//! image type across a channel; all sending happens on the synchronized
//! registry path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::Result;
use crate::registry::Registry;

/// Extract the affected image type from a store event, if it is a
/// manifest-install (rename-into-place of `manifest.json`).
pub fn manifest_image_type(event: &Event) -> Option<String> {
    if !matches!(
        event.kind,
        EventKind::Modify(ModifyKind::Name(RenameMode::To))
    ) {
        return None;
    }
    event.paths.iter().find_map(|path| {
        if path.file_name()?.to_str()? != "manifest.json" {
            return None;
        }
        Some(path.parent()?.file_name()?.to_str()?.to_string())
    })
}

/// Watch each per-type subdirectory and feed install events into the
/// registry broadcast path. The returned watcher must be kept alive for as
/// long as notifications are wanted.
pub fn spawn_manifest_watch(
    image_path: &Path,
    registry: Arc<Registry>,
) -> Result<notify::RecommendedWatcher> {
    let (tx, mut rx) = mpsc::channel::<String>(16);

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if let Some(image_type) = manifest_image_type(&event) {
                let _ = tx.blocking_send(image_type);
            }
        }
        Err(e) => warn!("Image store watch error: {}", e),
    })?;

    for image_type in registry.image_types() {
        let type_path: PathBuf = image_path.join(image_type);
        watcher.watch(&type_path, RecursiveMode::NonRecursive)?;
        info!("Watching {} for manifest installs", type_path.display());
    }

    tokio::spawn(async move {
        while let Some(image_type) = rx.recv().await {
            if !registry.serves_image_type(&image_type) {
                continue;
            }
            info!("New manifest for: {}", image_type);
            registry.broadcast_new_manifest(&image_type);
        }
    });

    Ok(watcher)
}
