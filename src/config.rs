use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, loaded from `cartographer.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the source tree to index
    pub root: PathBuf,
    /// Extra path substrings to exclude on top of the built-in list
    pub exclude: Vec<String>,
    /// Index test directories as well
    pub include_tests: bool,
    /// Quiescence window for the change watcher
    pub debounce_ms: u64,
    /// Where `save`/`load` put the embedding index
    pub index_path: Option<PathBuf>,
    pub embedding: EmbeddingConfig,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            exclude: Vec::new(),
            include_tests: false,
            debounce_ms: 100,
            index_path: None,
            embedding: EmbeddingConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Config rooted at `root` with every other field defaulted.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| self.root.join(".cartographer").join("index.json"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    /// Remote endpoint, e.g. `http://spark:8080/embed`
    pub endpoint: Option<String>,
    /// Vector size the remote service produces
    pub dimensions: usize,
    /// Prefix applied to query texts by the local provider
    pub query_instruction: Option<String>,
    pub request_timeout_secs: u64,
    pub resource_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub max_batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Local,
            endpoint: None,
            dimensions: 4096,
            query_instruction: None,
            request_timeout_secs: 60,
            resource_timeout_secs: 300,
            max_attempts: 3,
            backoff_base_ms: 1000,
            max_batch_size: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfig {
    /// SQLite file holding cached vectors; in-memory cache when unset
    pub path: Option<PathBuf>,
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("cartographer.toml")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<Config>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: Config = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &Config, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
