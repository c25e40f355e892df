use std::path::Path;

/// Directory markers that never hold first-party sources.
///
/// Matched as substrings of `/<relative path>`, so `/build/` also rejects a
/// top-level `build` directory.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "/.build/",
    "/.git/",
    "/.cartographer/",
    "/target/",
    "/node_modules/",
    "/vendor/",
    "/Pods/",
    "/Carthage/",
    "/DerivedData/",
    "/build/",
    "/dist/",
    "/out/",
    "/__pycache__/",
    "/.venv/",
    "/venv/",
];

/// Test directories, excluded unless tests are requested.
pub const TEST_EXCLUDES: &[&str] = &["/tests/", "/test/", "/Tests/", "/__tests__/"];

/// Substring-based path filter shared by the scanner and the change watcher.
#[derive(Debug, Clone)]
pub struct PathFilter {
    excludes: Vec<String>,
}

impl PathFilter {
    pub fn new(extra_excludes: &[String], include_tests: bool) -> Self {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        if !include_tests {
            excludes.extend(TEST_EXCLUDES.iter().map(|s| s.to_string()));
        }
        excludes.extend(extra_excludes.iter().filter(|s| !s.is_empty()).cloned());
        Self { excludes }
    }

    /// Check a path relative to the root. Hidden components are always rejected.
    pub fn is_excluded(&self, relative: &str) -> bool {
        if relative
            .split('/')
            .any(|part| part.starts_with('.') && part != "." && part != "..")
        {
            return true;
        }

        let candidate = format!("/{}", relative.trim_start_matches('/'));
        self.excludes.iter().any(|pattern| candidate.contains(pattern.as_str()))
    }

    /// Directory variant: a trailing slash lets `/build/` match `build` itself.
    pub fn is_excluded_dir(&self, relative: &str) -> bool {
        if relative.is_empty() {
            return false;
        }
        self.is_excluded(&format!("{}/", relative.trim_end_matches('/')))
    }
}

/// Relative, forward-slash form of `path` under `root`.
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
