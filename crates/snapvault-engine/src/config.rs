use serde::Deserialize;
use snapvault_core::{DEFAULT_EMBEDDING_DIM, DEFAULT_MATCH_LIMIT, DEFAULT_MATCH_THRESHOLD};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration, from an optional TOML file plus `SNAPVAULT_*`
/// environment variables. Environment overrides file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Embedding dimensionality for this deployment.
    pub embedding_dim: usize,
    /// Similarity score in [0, 1] below which a candidate is excluded.
    pub match_threshold: f32,
    /// Maximum matches returned (and persisted) per search.
    pub match_limit: usize,
    /// Capacity of the ingest queue; uploads beyond it wait.
    pub ingest_queue_depth: usize,
    /// Retries after a failed photo ingest before the photo is marked failed.
    pub ingest_retries: u32,
    /// Delay between ingest retries.
    pub ingest_retry_delay: Duration,
    /// Cap on detections recorded per photo.
    pub max_faces_per_photo: usize,
}

/// File-level keys; all optional so a partial file is fine.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    db_path: Option<PathBuf>,
    embedding_dim: Option<usize>,
    match_threshold: Option<f32>,
    match_limit: Option<usize>,
    ingest_queue_depth: Option<usize>,
    ingest_retries: Option<u32>,
    ingest_retry_delay_ms: Option<u64>,
    max_faces_per_photo: Option<usize>,
}

impl Config {
    /// Load configuration: defaults, then the TOML file named by
    /// `SNAPVAULT_CONFIG` (if set), then `SNAPVAULT_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("SNAPVAULT_CONFIG") {
            Ok(path) => {
                let path = PathBuf::from(path);
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str::<FileConfig>(&raw)
                    .map_err(|source| ConfigError::Parse { path, source })?
            }
            Err(_) => FileConfig::default(),
        };

        let db_path = std::env::var("SNAPVAULT_DB_PATH")
            .map(PathBuf::from)
            .ok()
            .or(file.db_path)
            .unwrap_or_else(default_db_path);

        let config = Self {
            db_path,
            embedding_dim: env_usize("SNAPVAULT_EMBEDDING_DIM")
                .or(file.embedding_dim)
                .unwrap_or(DEFAULT_EMBEDDING_DIM),
            match_threshold: env_f32("SNAPVAULT_MATCH_THRESHOLD")
                .or(file.match_threshold)
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            match_limit: env_usize("SNAPVAULT_MATCH_LIMIT")
                .or(file.match_limit)
                .unwrap_or(DEFAULT_MATCH_LIMIT),
            ingest_queue_depth: env_usize("SNAPVAULT_INGEST_QUEUE_DEPTH")
                .or(file.ingest_queue_depth)
                .unwrap_or(64),
            ingest_retries: env_u32("SNAPVAULT_INGEST_RETRIES")
                .or(file.ingest_retries)
                .unwrap_or(3),
            ingest_retry_delay: Duration::from_millis(
                env_u64("SNAPVAULT_INGEST_RETRY_DELAY_MS")
                    .or(file.ingest_retry_delay_ms)
                    .unwrap_or(500),
            ),
            max_faces_per_photo: env_usize("SNAPVAULT_MAX_FACES_PER_PHOTO")
                .or(file.max_faces_per_photo)
                .unwrap_or(8),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dim == 0 {
            return Err(ConfigError::Invalid("embedding_dim must be > 0".into()));
        }
        if !self.match_threshold.is_finite() || !(0.0..=1.0).contains(&self.match_threshold) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold {} outside [0, 1]",
                self.match_threshold
            )));
        }
        if self.match_limit == 0 {
            return Err(ConfigError::Invalid("match_limit must be > 0".into()));
        }
        if self.ingest_queue_depth == 0 {
            return Err(ConfigError::Invalid("ingest_queue_depth must be > 0".into()));
        }
        if self.max_faces_per_photo == 0 {
            return Err(ConfigError::Invalid(
                "max_faces_per_photo must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            match_limit: DEFAULT_MATCH_LIMIT,
            ingest_queue_depth: 64,
            ingest_retries: 3,
            ingest_retry_delay: Duration::from_millis(500),
            max_faces_per_photo: 8,
        }
    }
}

fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("snapvault")
        .join("snapvault.db")
}

fn env_f32(key: &str) -> Option<f32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.embedding_dim, 128);
        assert_eq!(config.match_limit, 50);
        assert!((config.match_threshold - 0.60).abs() < 1e-6);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let config = Config {
            match_threshold: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_dim() {
        let config = Config {
            embedding_dim: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_config_parses_partial() {
        let file: FileConfig = toml::from_str("match_threshold = 0.7\nmatch_limit = 10").unwrap();
        assert_eq!(file.match_threshold, Some(0.7));
        assert_eq!(file.match_limit, Some(10));
        assert!(file.db_path.is_none());
    }
}
