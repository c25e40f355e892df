//! Change watcher
//!
//! Subscribes to filesystem notifications below the snapshot root, collects
//! touched paths into a pending set and flushes them into the store once the
//! tree has been quiet for the debounce window.

mod debounce;

pub use debounce::{Debouncer, PendingSender};

use crate::ignore::relative_key;
use crate::source::SnapshotStore;
use crate::Result;
use ignore::WalkBuilder;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Handle to a running watcher. Dropping it stops watching.
pub struct ChangeWatcher {
    watcher: Option<RecommendedWatcher>,
    debouncer: Option<Debouncer>,
}

impl ChangeWatcher {
    /// Start watching `store`'s root, refreshing the store after each quiet period.
    pub fn start(store: Arc<SnapshotStore>, delay: Duration) -> Result<Self> {
        let flush_store = Arc::clone(&store);
        let debouncer = Debouncer::spawn(delay, move |paths: Vec<String>| {
            let report = flush_store.refresh(&paths);
            tracing::info!("Applied {} watched changes: {}", paths.len(), report);
        });

        let root = store.root().to_path_buf();
        let watch_root = root.clone();
        let pending = debouncer.sender();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for relative in relevant_paths(&store, &root, &event) {
                        pending.touch(relative);
                    }
                }
                Err(e) => tracing::error!("Watch error: {e}"),
            },
            Config::default(),
        )?;

        watcher.watch(&watch_root, RecursiveMode::Recursive)?;
        tracing::info!("Watching {} for changes", watch_root.display());

        Ok(Self {
            watcher: Some(watcher),
            debouncer: Some(debouncer),
        })
    }

    /// Stop receiving notifications and flush whatever is still pending.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Unsubscribe first so no callback races the final flush
        self.watcher.take();
        if let Some(debouncer) = self.debouncer.take() {
            debouncer.stop();
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Relative paths in `event` that the store cares about.
///
/// A directory event stands for every source below it: cached units under a
/// removed or renamed-away directory, and files inside one that appeared.
fn relevant_paths(store: &SnapshotStore, root: &Path, event: &Event) -> Vec<String> {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
        _ => return Vec::new(),
    }

    let mut cached: Option<Vec<String>> = None;
    let mut paths = BTreeSet::new();

    for path in &event.paths {
        let Some(relative) = relative_key(root, path) else {
            continue;
        };
        if store.accepts(&relative) {
            paths.insert(relative);
            continue;
        }

        let prefix = format!("{}/", relative);
        let cached = cached.get_or_insert_with(|| store.paths());
        paths.extend(cached.iter().filter(|key| key.starts_with(&prefix)).cloned());

        if path.is_dir() {
            paths.extend(sources_below(store, root, path));
        }
    }

    paths.into_iter().collect()
}

fn sources_below(store: &SnapshotStore, root: &Path, dir: &Path) -> Vec<String> {
    WalkBuilder::new(dir)
        .standard_filters(false)
        .hidden(true)
        .follow_links(false)
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .filter_map(|entry| relative_key(root, entry.path()))
        .filter(|relative| store.accepts(relative))
        .collect()
}
