//! Source Snapshot Store
//!
//! Holds the current set of source units for a root directory. Each unit
//! carries its text, a blake3 fingerprint and a syntax tree that is built at
//! most once, on first access.

pub mod parser;
pub mod store;

pub use parser::{SyntaxParser, TreeSitterParser};
pub use store::{RefreshReport, SnapshotStats, SnapshotStore};

use std::sync::OnceLock;
use tree_sitter::Tree;

/// Fast content hash used to detect edits.
pub fn fingerprint(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Status of a file after a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    New,
    Modified,
    Unchanged,
    Removed,
}

/// One source file as seen by the last scan or refresh.
///
/// Units are immutable apart from the memoized tree; a content change
/// replaces the whole unit.
#[derive(Debug)]
pub struct SourceUnit {
    path: String,
    text: String,
    fingerprint: String,
    tree: OnceLock<Option<Tree>>,
}

impl SourceUnit {
    pub fn new(path: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let fingerprint = fingerprint(&text);
        Self {
            path: path.into(),
            text,
            fingerprint,
            tree: OnceLock::new(),
        }
    }

    /// Path relative to the snapshot root
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// True once a build has run, whether or not it produced a tree
    pub fn is_parsed(&self) -> bool {
        self.tree.get().is_some()
    }

    /// The memoized tree, building it on first access.
    ///
    /// Concurrent first callers block on the same initialization and all
    /// observe its single result.
    pub fn tree(&self, parser: &dyn SyntaxParser) -> Option<&Tree> {
        self.tree
            .get_or_init(|| {
                let tree = parser.parse(&self.path, &self.text);
                if tree.is_none() {
                    tracing::warn!("Failed to parse {}", self.path);
                }
                tree
            })
            .as_ref()
    }

    /// The tree if it has already been built
    pub fn built_tree(&self) -> Option<&Tree> {
        self.tree.get().and_then(Option::as_ref)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::SyntaxParser;
    use super::TreeSitterParser;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tree_sitter::Tree;

    /// Rust parser that counts builds and stalls a little to widen races.
    pub struct CountingParser {
        inner: TreeSitterParser,
        pub builds: AtomicUsize,
        delay: Duration,
    }

    impl CountingParser {
        pub fn new(delay: Duration) -> Self {
            Self {
                inner: TreeSitterParser::only(&["rs"]),
                builds: AtomicUsize::new(0),
                delay,
            }
        }

        pub fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }
    }

    impl SyntaxParser for CountingParser {
        fn supports(&self, path: &Path) -> bool {
            self.inner.supports(path)
        }

        fn parse(&self, path: &str, source: &str) -> Option<Tree> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.inner.parse(path, source)
        }
    }
}
