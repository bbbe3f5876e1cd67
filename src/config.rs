use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string()]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DbConfig {
    /// Defaults to `<root>/.pmo/index.sqlite`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_wait_ms: default_max_wait_ms(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl WatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

fn default_debounce_ms() -> u64 {
    300
}
fn default_max_wait_ms() -> u64 {
    3000
}
fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_store_retries")]
    pub store_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store_retries: default_store_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_store_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            dims: default_dims(),
            url: default_url(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            max_chars: default_max_chars(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_max_chars() -> usize {
    500
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k: default_candidate_k(),
            final_limit: default_final_limit(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> i64 {
    40
}
fn default_final_limit() -> i64 {
    12
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Config {
    /// A default configuration rooted at `root`, used when no config file exists.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            workspace: WorkspaceConfig {
                root: root.into(),
                ..WorkspaceConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.db
            .path
            .clone()
            .unwrap_or_else(|| self.workspace.root.join(".pmo").join("index.sqlite"))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.workspace.include_globs.is_empty() {
        anyhow::bail!("workspace.include_globs must not be empty");
    }

    if config.watch.workers == 0 {
        anyhow::bail!("watch.workers must be >= 1");
    }
    if config.watch.queue_capacity == 0 {
        anyhow::bail!("watch.queue_capacity must be >= 1");
    }
    if config.watch.max_wait_ms < config.watch.debounce_ms {
        anyhow::bail!("watch.max_wait_ms must be >= watch.debounce_ms");
    }

    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }

    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.max_chars == 0 {
        anyhow::bail!("embedding.max_chars must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, ollama, openai, or local.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: Config = toml::from_str("[workspace]\nroot = \"./ws\"\n").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.watch.debounce_ms, 300);
        assert_eq!(config.embedding.max_chars, 500);
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert_eq!(config.db_path(), PathBuf::from("./ws/.pmo/index.sqlite"));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let config: Config =
            toml::from_str("[workspace]\nroot = \".\"\n[embedding]\nprovider = \"magic\"\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = Config::for_root(".");
        config.watch.workers = 0;
        assert!(validate(&config).is_err());
    }
}
