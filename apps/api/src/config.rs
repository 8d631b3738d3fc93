use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

pub const DEFAULT_EMBEDDER_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_EMBEDDING_DIM: usize = 384;
pub const DEFAULT_INDEX_FLUSH_SECS: u64 = 5;

/// Application configuration loaded from environment variables.
/// Every variable has a default; startup only fails on values that do not parse.
#[derive(Debug, Clone)]
pub struct Config {
    /// Holds `interactions.jsonl` and the `derived/` generations.
    pub data_dir: PathBuf,
    pub port: u16,
    pub rust_log: String,
    /// OpenAI-compatible embeddings server. Unset means the built-in hash embedder.
    pub embedder_url: Option<String>,
    pub embedder_model: String,
    pub embedder_api_key: Option<String>,
    pub embedding_dim: usize,
    pub fsync_ledger: bool,
    /// How often the live vector index is written to disk.
    pub index_flush_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let embedding_dim = non_empty("EMBEDDING_DIM")
            .map(|v| v.parse::<usize>())
            .transpose()
            .context("EMBEDDING_DIM must be a positive integer")?
            .unwrap_or(DEFAULT_EMBEDDING_DIM);
        if embedding_dim == 0 {
            anyhow::bail!("EMBEDDING_DIM must be a positive integer");
        }

        let index_flush_secs = non_empty("INDEX_FLUSH_SECS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("INDEX_FLUSH_SECS must be a positive integer")?
            .unwrap_or(DEFAULT_INDEX_FLUSH_SECS);
        if index_flush_secs == 0 {
            anyhow::bail!("INDEX_FLUSH_SECS must be a positive integer");
        }

        Ok(Config {
            data_dir: PathBuf::from(
                non_empty("FEEDBACK_DATA_DIR").unwrap_or_else(|| "feedback_db".to_string()),
            ),
            port: non_empty("PORT")
                .unwrap_or_else(|| "8000".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: non_empty("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            embedder_url: non_empty("EMBEDDER_URL"),
            embedder_model: non_empty("EMBEDDER_MODEL")
                .unwrap_or_else(|| DEFAULT_EMBEDDER_MODEL.to_string()),
            embedder_api_key: non_empty("EMBEDDER_API_KEY"),
            embedding_dim,
            fsync_ledger: match non_empty("FSYNC_LEDGER") {
                Some(v) => parse_bool(&v).context("FSYNC_LEDGER must be true or false")?,
                None => true,
            },
            index_flush_interval: Duration::from_secs(index_flush_secs),
        })
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("not a boolean: '{other}'"),
    }
}
