use crate::error::Result;
use crate::manifest::{manifest_path, Manifest, MANIFEST_FILE};
use crate::receipt::digest;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Content digests of a set of files at one point in time. Change detection
/// is digest-based, not mtime-based, so touching a file without changing it
/// never triggers a re-sync.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    entries: BTreeMap<PathBuf, Option<String>>,
}

impl Snapshot {
    /// Digest every file; missing files record `None` so appearing and
    /// disappearing both count as changes.
    pub fn take(root: &Path, files: &[PathBuf]) -> Snapshot {
        let mut entries = BTreeMap::new();
        for file in files {
            let full = root.join(file);
            let entry = std::fs::read(&full).ok().map(|bytes| digest(&bytes));
            entries.insert(file.clone(), entry);
        }
        Snapshot { entries }
    }

    /// Paths whose digest differs from `earlier`, including files added or
    /// removed from the watched set.
    pub fn changed_since(&self, earlier: &Snapshot) -> Vec<PathBuf> {
        let mut changed = Vec::new();
        for (path, entry) in &self.entries {
            if earlier.entries.get(path) != Some(entry) {
                changed.push(path.clone());
            }
        }
        for path in earlier.entries.keys() {
            if !self.entries.contains_key(path) {
                changed.push(path.clone());
            }
        }
        changed
    }
}

/// All files a change to which should trigger a re-sync: every transform's
/// referenced files plus the manifest itself.
pub fn watched_files(manifest: &Manifest) -> Vec<PathBuf> {
    let mut files = vec![PathBuf::from(MANIFEST_FILE)];
    for spec in manifest.transforms.values() {
        for file in manifest.referenced_files(spec) {
            if !files.contains(&file) {
                files.push(file);
            }
        }
    }
    files
}

// ---------------------------------------------------------------------------
// Watch loop
// ---------------------------------------------------------------------------

/// Poll the watched file set and invoke `on_change` with the changed paths.
/// The manifest is re-read after each change so edits to the transform set
/// are picked up. Returns when the cancel flag is set.
pub fn watch<F>(
    root: &Path,
    interval: Duration,
    cancel: Arc<AtomicBool>,
    mut on_change: F,
) -> Result<()>
where
    F: FnMut(&[PathBuf]),
{
    let mut manifest = Manifest::load(root)?;
    let mut files = watched_files(&manifest);
    let mut snapshot = Snapshot::take(root, &files);

    while !cancel.load(Ordering::Relaxed) {
        sleep_with_cancel(interval, &cancel);
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        let current = Snapshot::take(root, &files);
        let changed = current.changed_since(&snapshot);
        if changed.is_empty() {
            continue;
        }
        tracing::debug!(?changed, "watched files changed");
        on_change(&changed);
        // Re-read the manifest in case the change altered the watch set,
        // then re-snapshot so one edit fires exactly once.
        if manifest_path(root).exists() {
            if let Ok(reloaded) = Manifest::load(root) {
                manifest = reloaded;
                files = watched_files(&manifest);
            }
        }
        snapshot = Snapshot::take(root, &files);
    }
    Ok(())
}

fn sleep_with_cancel(interval: Duration, cancel: &AtomicBool) {
    let step = Duration::from_millis(50);
    let mut remaining = interval;
    while remaining > Duration::ZERO && !cancel.load(Ordering::Relaxed) {
        let chunk = remaining.min(step);
        std::thread::sleep(chunk);
        remaining = remaining.saturating_sub(chunk);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
