use crate::engine::LoaderOptions;
use crate::model::SchemaVariant;
use crate::source::DEFAULT_CHUNK_SIZE;
use crate::store::DEFAULT_BATCH_SIZE;
use anyhow::{Context, Result};

/// Environment settings.
///
/// The chunk size is fixed at [`DEFAULT_CHUNK_SIZE`]: checkpoints are chunk
/// indexes, so resuming with a different size would skip or repeat rows.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub max_connections: u32,
    pub schema: SchemaVariant,
    pub batch_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment in production)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let schema = match lookup("LOADER_SCHEMA") {
            Some(value) => value.parse().context("Invalid LOADER_SCHEMA")?,
            None => SchemaVariant::default(),
        };

        let batch_size = positive(&lookup, "LOADER_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;

        Ok(Self {
            db_url: lookup("DB_URL").context("DB_URL env var missing")?,
            max_connections: lookup("DB_MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            schema,
            batch_size,
        })
    }

    pub fn loader_options(&self) -> LoaderOptions {
        LoaderOptions {
            variant: self.schema,
            chunk_size: DEFAULT_CHUNK_SIZE,
            batch_size: self.batch_size,
        }
    }
}

fn positive(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> Result<usize> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value: usize = raw
        .trim()
        .parse()
        .with_context(|| format!("{} must be a positive integer, got '{}'", key, raw))?;
    if value == 0 {
        anyhow::bail!("{} must be greater than zero", key);
    }
    Ok(value)
}
