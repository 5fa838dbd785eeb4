use std::path::PathBuf;

use anyhow::{bail, ensure, Context, Result};

use crate::corpus::schema::{is_supported_version, DEFAULT_SCHEMA_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Remote Git Data API.
    Github,
    /// In-process store; nothing survives a restart except the local cache.
    Memory,
}

/// Application configuration loaded from environment variables.
/// Startup fails if a required variable is missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub github_token: Option<String>,
    pub github_owner: Option<String>,
    pub github_api_url: String,
    pub memory_repo: String,
    pub cache_dir: PathBuf,
    pub schema_version: String,
    pub max_pages: u32,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let require = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("Required environment variable '{key}' is not set"))
        };

        let store_backend = match var("STORE_BACKEND", "github").to_ascii_lowercase().as_str() {
            "github" => StoreBackend::Github,
            "memory" => StoreBackend::Memory,
            other => bail!("STORE_BACKEND must be 'github' or 'memory', got '{other}'"),
        };
        let (github_token, github_owner) = match store_backend {
            StoreBackend::Github => (Some(require("GITHUB_TOKEN")?), Some(require("GITHUB_OWNER")?)),
            StoreBackend::Memory => (lookup("GITHUB_TOKEN"), lookup("GITHUB_OWNER")),
        };

        let schema_version = var("SCHEMA_VERSION", DEFAULT_SCHEMA_VERSION);
        ensure!(
            is_supported_version(&schema_version),
            "SCHEMA_VERSION '{schema_version}' is not supported"
        );

        let max_pages = var("MAX_PAGES", "1")
            .parse::<u32>()
            .context("MAX_PAGES must be a positive integer")?;
        ensure!(max_pages >= 1, "MAX_PAGES must be at least 1");

        Ok(Config {
            store_backend,
            github_token,
            github_owner,
            github_api_url: var("GITHUB_API_URL", "https://api.github.com"),
            memory_repo: var("MEMORY_REPO", "career-corpus-memory"),
            cache_dir: PathBuf::from(var("CACHE_DIR", ".corpus-cache")),
            schema_version,
            max_pages,
            port: var("PORT", "8080")
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: var("RUST_LOG", "info"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_memory_backend_defaults() {
        let config = config(&[("STORE_BACKEND", "memory")]).unwrap();
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.memory_repo, "career-corpus-memory");
        assert_eq!(config.schema_version, "1.0.0");
        assert_eq!(config.max_pages, 1);
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn test_github_backend_requires_credentials() {
        let err = config(&[]).unwrap_err();
        assert!(err.to_string().contains("GITHUB_TOKEN"));

        let config = config(&[("GITHUB_TOKEN", "t"), ("GITHUB_OWNER", "me")]).unwrap();
        assert_eq!(config.store_backend, StoreBackend::Github);
        assert_eq!(config.github_owner.as_deref(), Some("me"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(config(&[("STORE_BACKEND", "s3")]).is_err());
        assert!(config(&[("STORE_BACKEND", "memory"), ("SCHEMA_VERSION", "2.0.0")]).is_err());
        assert!(config(&[("STORE_BACKEND", "memory"), ("MAX_PAGES", "0")]).is_err());
        assert!(config(&[("STORE_BACKEND", "memory"), ("PORT", "http")]).is_err());
    }
}
