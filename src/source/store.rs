//! Snapshot store implementation

use super::{FileStatus, SourceUnit, SyntaxParser, fingerprint};
use crate::config::Config;
use crate::ignore::{PathFilter, relative_key};
use crate::{Error, Result};
use ignore::WalkBuilder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Instant, SystemTime};

#[derive(Debug, Default)]
struct Snapshot {
    units: HashMap<String, Arc<SourceUnit>>,
    last_scan: Option<SystemTime>,
}

/// Owns the source units below one root directory.
///
/// The map sits behind a single `RwLock`, so readers always see either the
/// state before or after a scan. Tree builds are synchronized per unit and
/// never take the map lock.
pub struct SnapshotStore {
    root: PathBuf,
    filter: PathFilter,
    parser: Arc<dyn SyntaxParser>,
    snapshot: RwLock<Snapshot>,
    workers: usize,
}

impl SnapshotStore {
    pub fn new(config: &Config, parser: Arc<dyn SyntaxParser>) -> Self {
        let root = config
            .root
            .canonicalize()
            .unwrap_or_else(|_| config.root.clone());
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            root,
            filter: PathFilter::new(&config.exclude, config.include_tests),
            parser,
            snapshot: RwLock::new(Snapshot::default()),
            workers,
        }
    }

    /// Override the warm-up pool size
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn filter(&self) -> &PathFilter {
        &self.filter
    }

    pub fn parser(&self) -> &dyn SyntaxParser {
        self.parser.as_ref()
    }

    /// Whether a path relative to the root is a candidate source file
    pub fn accepts(&self, relative: &str) -> bool {
        !self.filter.is_excluded(relative) && self.parser.supports(Path::new(relative))
    }

    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.snapshot.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-enumerate the root and reconcile the snapshot with disk.
    ///
    /// Units whose fingerprint is unchanged are kept as-is, tree included.
    /// Returns the number of units after the scan.
    pub fn scan(&self) -> Result<usize> {
        if !self.root.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("source root {} is not a directory", self.root.display()),
            )));
        }

        let started = Instant::now();
        let mut snapshot = self.write();
        let candidates = self.enumerate();

        let mut next = HashMap::with_capacity(candidates.len());
        let (mut added, mut changed, mut kept) = (0usize, 0usize, 0usize);

        for (key, full_path) in candidates {
            let text = match std::fs::read_to_string(&full_path) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("Skipping unreadable file {}: {}", full_path.display(), e);
                    continue;
                }
            };

            match snapshot.units.get(&key) {
                Some(existing) if existing.fingerprint() == fingerprint(&text) => {
                    kept += 1;
                    next.insert(key, Arc::clone(existing));
                }
                existing => {
                    if existing.is_some() {
                        changed += 1;
                    } else {
                        added += 1;
                    }
                    let unit = Arc::new(SourceUnit::new(key.clone(), text));
                    next.insert(key, unit);
                }
            }
        }

        let removed = snapshot
            .units
            .keys()
            .filter(|key| !next.contains_key(*key))
            .count();

        snapshot.units = next;
        snapshot.last_scan = Some(SystemTime::now());

        tracing::info!(
            "Scanned {} in {:?}: {} units ({} new, {} changed, {} unchanged, {} removed)",
            self.root.display(),
            started.elapsed(),
            snapshot.units.len(),
            added,
            changed,
            kept,
            removed
        );

        Ok(snapshot.units.len())
    }

    fn enumerate(&self) -> Vec<(String, PathBuf)> {
        let filter = self.filter.clone();
        let root = self.root.clone();

        let walker = WalkBuilder::new(&self.root)
            .standard_filters(false)
            .hidden(true)
            .follow_links(false)
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                match relative_key(&root, entry.path()) {
                    Some(rel) if is_dir => !filter.is_excluded_dir(&rel),
                    Some(rel) => !filter.is_excluded(&rel),
                    None => true,
                }
            })
            .build();

        let mut candidates = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Walk error under {}: {}", self.root.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            if !self.parser.supports(entry.path()) {
                continue;
            }
            if let Some(key) = relative_key(&self.root, entry.path()) {
                candidates.push((key, entry.into_path()));
            }
        }
        candidates
    }

    /// Cached unit for `path`, reading it from disk if it is not cached.
    pub fn get(&self, path: &str) -> Option<Arc<SourceUnit>> {
        if let Some(unit) = self.read().units.get(path) {
            return Some(Arc::clone(unit));
        }

        if !self.accepts(path) {
            return None;
        }

        let text = match std::fs::read_to_string(self.root.join(path)) {
            Ok(text) => text,
            Err(e) => {
                tracing::debug!("Cannot load {}: {}", path, e);
                return None;
            }
        };

        let mut snapshot = self.write();
        let unit = snapshot
            .units
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(SourceUnit::new(path, text)));
        Some(Arc::clone(unit))
    }

    /// Like `get`, but also makes sure the unit's tree has been built.
    pub fn get_parsed(&self, path: &str) -> Option<Arc<SourceUnit>> {
        let unit = self.get(path)?;
        unit.tree(self.parser.as_ref());
        Some(unit)
    }

    /// Build every unparsed tree on a worker pool and wait for all of them.
    ///
    /// Returns the number of units that were built by this call.
    pub fn warm_cache(&self) -> Result<usize> {
        let pending: Vec<Arc<SourceUnit>> = self
            .read()
            .units
            .values()
            .filter(|unit| !unit.is_parsed())
            .cloned()
            .collect();

        if pending.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let total = pending.len();
        let workers = self.workers.min(total);
        let (tx, rx) = crossbeam::channel::unbounded::<Arc<SourceUnit>>();
        for unit in pending {
            // The receiver outlives this loop, so sending cannot fail
            let _ = tx.send(unit);
        }
        drop(tx);

        let parser = self.parser.as_ref();
        crossbeam::scope(|scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                scope.spawn(move |_| {
                    for unit in rx.iter() {
                        unit.tree(parser);
                    }
                });
            }
        })
        .map_err(|_| Error::Parse("cache warm-up worker panicked".to_string()))?;

        tracing::info!(
            "Warmed {} units on {} workers in {:?}",
            total,
            workers,
            started.elapsed()
        );
        Ok(total)
    }

    /// Drop one unit; the next `get` reloads it from disk.
    pub fn invalidate(&self, path: &str) -> bool {
        self.write().units.remove(path).is_some()
    }

    /// Drop every unit. Returns how many were cached.
    pub fn invalidate_all(&self) -> usize {
        let mut snapshot = self.write();
        let count = snapshot.units.len();
        snapshot.units.clear();
        count
    }

    /// Re-read a batch of touched paths, typically from the change watcher.
    ///
    /// Each path is applied atomically; failures are logged and leave the
    /// prior state in place.
    pub fn refresh(&self, paths: &[String]) -> RefreshReport {
        let mut report = RefreshReport::default();

        for path in paths {
            let full_path = self.root.join(path);

            if full_path.is_file() {
                match std::fs::read_to_string(&full_path) {
                    Ok(text) => {
                        let status = self.replace(path, text);
                        report.record(path, status);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to re-read {}: {}", path, e);
                        report.failed.push(path.clone());
                    }
                }
            } else if !full_path.exists() {
                if self.write().units.remove(path).is_some() {
                    report.record(path, FileStatus::Removed);
                }
            }
        }

        report
    }

    fn replace(&self, path: &str, text: String) -> FileStatus {
        let mut snapshot = self.write();
        match snapshot.units.get(path) {
            Some(existing) if existing.fingerprint() == fingerprint(&text) => FileStatus::Unchanged,
            existing => {
                let status = if existing.is_some() {
                    FileStatus::Modified
                } else {
                    FileStatus::New
                };
                snapshot
                    .units
                    .insert(path.to_string(), Arc::new(SourceUnit::new(path, text)));
                status
            }
        }
    }

    /// All cached paths, sorted
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.read().units.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.read().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SnapshotStats {
        let snapshot = self.read();
        SnapshotStats {
            units: snapshot.units.len(),
            parsed: snapshot.units.values().filter(|u| u.is_parsed()).count(),
            last_scan: snapshot.last_scan,
        }
    }
}

/// What a refresh did to each touched path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

impl RefreshReport {
    fn record(&mut self, path: &str, status: FileStatus) {
        let bucket = match status {
            FileStatus::New => &mut self.created,
            FileStatus::Modified => &mut self.updated,
            FileStatus::Unchanged => &mut self.unchanged,
            FileStatus::Removed => &mut self.removed,
        };
        bucket.push(path.to_string());
    }

    /// Number of paths whose unit changed
    pub fn changes(&self) -> usize {
        self.created.len() + self.updated.len() + self.removed.len()
    }
}

impl std::fmt::Display for RefreshReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} new, {} updated, {} removed, {} unchanged, {} failed",
            self.created.len(),
            self.updated.len(),
            self.removed.len(),
            self.unchanged.len(),
            self.failed.len()
        )
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStats {
    pub units: usize,
    pub parsed: usize,
    pub last_scan: Option<SystemTime>,
}

impl std::fmt::Display for SnapshotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Snapshot Statistics:")?;
        writeln!(f, "  Units: {}", self.units)?;
        write!(f, "  Parsed: {}", self.parsed)
    }
}
