//! Configuration for karibu.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (KARIBU_HOME, KARIBU_DB, service credentials)
//! 2. Config file (.karibu/config.yaml)
//! 3. Defaults (~/.karibu)
//!
//! Config file discovery:
//! - Searches current directory and parents for .karibu/config.yaml
//! - Paths in config file are relative to the .karibu/ directory
//!
//! Service credentials are only ever read from the environment.

pub mod paths;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{OpenAiConfig, StorageConfig, WhatsAppConfig};
use crate::client::SyncConfig;
use crate::core::RetryPolicy;
use crate::pipeline::PipelineConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const STORAGE_KEY_ENV: &str = "STORAGE_SERVICE_KEY";
const OPENAI_KEY_ENV: &str = "OPENAI_API_KEY";
const WHATSAPP_TOKEN_ENV: &str = "WHATSAPP_ACCESS_TOKEN";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Local state directory (relative to .karibu/)
    pub home: Option<String>,
    /// SQLite database file (relative to .karibu/)
    pub database: Option<String>,
    /// Where recordings are written before upload
    pub recordings: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
}

/// Resolved configuration with absolute paths and credentials filled in
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Local state directory
    pub home: PathBuf,
    /// SQLite database file
    pub database: PathBuf,
    /// Local recordings directory
    pub recordings: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub sync: SyncConfig,
    pub pipeline: PipelineConfig,
    pub services: ServicesConfig,
}

impl ResolvedConfig {
    /// Offline upload queue
    pub fn pending_queue(&self) -> PathBuf {
        self.home.join("pending_visits.jsonl")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".karibu").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_secret(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Resolve a parsed file (or none) against the environment
fn resolve(file: ConfigFile, config_file: Option<PathBuf>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".karibu");

    // Relative paths in the file are relative to .karibu/
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);
    let from_file = |value: &Option<String>| -> Option<PathBuf> {
        match (&base_dir, value) {
            (Some(base), Some(v)) => Some(resolve_path(base, v)),
            _ => None,
        }
    };

    let home = env_path("KARIBU_HOME")
        .or_else(|| from_file(&file.paths.home))
        .unwrap_or(default_home);

    let database = env_path("KARIBU_DB")
        .or_else(|| from_file(&file.paths.database))
        .unwrap_or_else(|| home.join("karibu.db"));

    let recordings = from_file(&file.paths.recordings).unwrap_or_else(|| home.join("recordings"));

    let mut services = file.services;
    services.storage.service_key = env_secret(STORAGE_KEY_ENV);
    services.openai.api_key = env_secret(OPENAI_KEY_ENV);
    services.whatsapp.access_token = env_secret(WHATSAPP_TOKEN_ENV);

    Ok(ResolvedConfig {
        home,
        database,
        recordings,
        config_file,
        retry: file.retry,
        sync: file.sync,
        pipeline: file.pipeline,
        services,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    match find_config_file() {
        Some(path) => {
            let file = load_config_file(&path)?;
            resolve(file, Some(path))
        }
        None => resolve(ConfigFile::default(), None),
    }
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let karibu_dir = temp.path().join(".karibu");
        std::fs::create_dir_all(&karibu_dir).unwrap();

        let config_path = karibu_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1"
paths:
  home: ./state
retry:
  max_attempts: 5
sync:
  debounce_ms: 500
pipeline:
  web_url: https://notes.example.org
services:
  storage:
    base_url: https://store.example.org
  whatsapp:
    phone_number_id: "1234"
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version.as_deref(), Some("1"));
        assert_eq!(config.paths.home.as_deref(), Some("./state"));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.sync.debounce_ms, 500);
        assert_eq!(config.pipeline.poll_max_attempts, 60);
        assert_eq!(config.services.storage.bucket, "audio-recordings");
        assert_eq!(config.services.whatsapp.phone_number_id, "1234");
        assert_eq!(config.services.openai.chat_model, "gpt-4-turbo-preview");
    }

    #[test]
    fn test_paths_resolve_relative_to_karibu_dir() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join(".karibu").join("config.yaml");
        let file = ConfigFile {
            paths: PathsConfig {
                home: None,
                database: Some("data/visits.db".to_string()),
                recordings: Some("/var/recordings".to_string()),
            },
            ..Default::default()
        };

        let resolved = resolve(file, Some(config_path)).unwrap();
        if std::env::var("KARIBU_DB").is_err() {
            assert_eq!(
                resolved.database,
                temp.path().join(".karibu").join("data/visits.db")
            );
        }
        assert_eq!(resolved.recordings, PathBuf::from("/var/recordings"));
    }

    #[test]
    fn test_credentials_never_come_from_file() {
        let file: ConfigFile = serde_yaml::from_str(
            "services:\n  openai:\n    api_key: sk-from-file\n",
        )
        .unwrap();
        assert!(file.services.openai.api_key.is_none());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
