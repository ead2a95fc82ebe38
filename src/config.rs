//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Built-in defaults (the `Default` impls below)
//! - TOML configuration file (config.toml, optional)
//! - Environment variables with the APP_ prefix
//! - HOST / PORT convenience overrides used by deployment platforms
//!
//! ## Priority (highest to lowest):
//! 1. HOST / PORT
//! 2. APP_* environment variables
//! 3. config.toml
//! 4. Defaults
//!
//! Validation runs once at startup so bad values fail fast with a clear
//! message instead of surfacing mid-request.

use crate::audio::segmenter::SegmenterConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub segmenter: SegmenterConfig,
    pub storage: StorageConfig,
    pub performance: PerformanceConfig,
}

/// Bind address for the HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Model selection settings.
///
/// `default_stt_model` is the key interviews and unspecified realtime configs
/// resolve against. It accepts either a size alias ("tiny" through "large")
/// or a full Hugging Face repository id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub default_stt_model: String,
    /// Compute device preference: "auto", "cpu", "cuda", or "metal".
    pub device: String,
}

/// Filesystem layout for uploads, transcripts, realtime scratch files, and
/// the interview database. All directories are created at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub upload_dir: String,
    pub transcript_dir: String,
    pub scratch_dir: String,
    pub database_path: String,
}

/// Service limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Cap on concurrently open realtime sessions; connections beyond it are
    /// refused.
    pub max_concurrent_sessions: usize,
    /// Upper bound on a single multipart upload, in bytes.
    pub max_upload_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            models: ModelsConfig {
                default_stt_model: "base".to_string(),
                device: "auto".to_string(),
            },
            segmenter: SegmenterConfig::default(),
            storage: StorageConfig {
                upload_dir: "data/uploads".to_string(),
                transcript_dir: "data/transcripts".to_string(),
                scratch_dir: "data/tmp".to_string(),
                database_path: "data/interviews.db".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                max_upload_bytes: 50 * 1024 * 1024,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`
    /// - `APP_SERVER_PORT=3000`
    /// - `HOST` / `PORT` take precedence over everything else
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject these without the APP_ prefix.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.models.default_stt_model.trim().is_empty() {
            return Err(anyhow::anyhow!("Default STT model cannot be empty"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.max_upload_bytes == 0 {
            return Err(anyhow::anyhow!("Max upload size must be greater than 0"));
        }

        self.segmenter
            .validate()
            .map_err(|e| anyhow::anyhow!("Segmenter configuration invalid: {}", e))?;

        Ok(())
    }

    /// Create the storage directories (uploads, transcripts, scratch, and the
    /// database's parent) if they do not exist yet.
    pub fn ensure_storage_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.storage.upload_dir)?;
        std::fs::create_dir_all(&self.storage.transcript_dir)?;
        std::fs::create_dir_all(&self.storage.scratch_dir)?;
        if let Some(parent) = PathBuf::from(&self.storage.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}
