use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::memory::store::VectorEncoding;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EchoConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub patterns: PatternConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: String,
    pub log_level: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database shared with the journal's entry store.
    pub db_path: String,
    /// On-disk vector encoding. `int8` trades a small similarity error for 4x smaller blobs.
    pub vector_encoding: VectorEncoding,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `local` (ONNX Runtime) or `hashed` (feature hashing, no model files).
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
    pub dimensions: usize,
    /// Instruction prepended to retrieval queries (BGE models are trained with one).
    pub query_prefix: String,
}

/// Knobs for the staged retrieval pipeline.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Candidates kept after the coarse full-text stage.
    pub coarse_top_n: usize,
    /// Survivors that get the sentence-level bonus.
    pub fine_top_k: usize,
    /// Weight of the summary similarity when blending (full text gets `1 - summary_weight`).
    pub summary_weight: f64,
    /// Multiplier applied to the best sentence similarity.
    pub sentence_bonus_weight: f64,
    pub recency_weight: f64,
    pub recency_half_life_days: f64,
    /// Coarse similarity below this never reaches the caller.
    pub similarity_floor: f64,
    pub max_results: usize,
    /// Sentences shorter than this are not embedded.
    pub min_sentence_words: usize,
}

/// Thresholds for pattern detection.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PatternConfig {
    /// Corpus size below which pattern detection stays locked.
    pub min_entries: usize,
    pub min_cluster_size: usize,
    pub mood_threshold: f32,
    pub topic_threshold: f32,
    /// Patterns under this confidence are hidden from listings.
    pub visibility_threshold: f64,
    /// Jaccard overlap at which a new cluster updates an existing pattern.
    pub overlap_threshold: f64,
    /// Cluster size at which the size factor of the confidence saturates.
    pub size_saturation: usize,
    /// Share of unfit new entries that forces a full re-cluster in incremental mode.
    pub max_unfit_ratio: f64,
    pub max_keywords: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub entry_delta: usize,
    pub interval_days: i64,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub query_capacity: usize,
    pub vector_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            log_level: "info".into(),
            host: "127.0.0.1".into(),
            port: 7437,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_echo_dir()
            .join("echo.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            vector_encoding: VectorEncoding::F32,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_echo_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "bge-small-en-v1.5".into(),
            cache_dir,
            dimensions: 384,
            query_prefix: "Represent this sentence for searching relevant passages: ".into(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            coarse_top_n: 50,
            fine_top_k: 10,
            summary_weight: 0.6,
            sentence_bonus_weight: 0.1,
            recency_weight: 0.05,
            recency_half_life_days: 30.0,
            similarity_floor: 0.3,
            max_results: 10,
            min_sentence_words: 5,
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            min_entries: 30,
            min_cluster_size: 3,
            mood_threshold: 0.75,
            topic_threshold: 0.70,
            visibility_threshold: 0.6,
            overlap_threshold: 0.5,
            size_saturation: 10,
            max_unfit_ratio: 0.3,
            max_keywords: 5,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            entry_delta: 10,
            interval_days: 7,
            poll_interval_secs: 300,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            query_capacity: 256,
            vector_capacity: 1024,
        }
    }
}

/// Returns `~/.echo/`
pub fn default_echo_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".echo")
}

/// Returns the default config file path: `~/.echo/config.toml`
pub fn default_config_path() -> PathBuf {
    default_echo_dir().join("config.toml")
}

impl EchoConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            EchoConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (ECHO_DB, ECHO_LOG_LEVEL, ECHO_EMBEDDING_PROVIDER).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ECHO_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("ECHO_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("ECHO_EMBEDDING_PROVIDER") {
            self.embedding.provider = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
