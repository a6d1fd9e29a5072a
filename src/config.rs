use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding one JSON array file per resource
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
    /// Only ever populated from the environment.
    #[serde(skip)]
    pub admin: AdminConfig,
}

fn default_port() -> u16 {
    3001
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "https://newsdesk.example.com".to_string(),
        "https://www.newsdesk.example.com".to_string(),
        "http://localhost:5173".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SecurityConfig {
    /// Require a valid bearer token on POST/PUT/DELETE resource routes
    #[serde(default)]
    pub require_token_for_writes: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
}

#[derive(Clone, Default)]
pub struct AdminConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub jwt_secret: Option<String>,
}

impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply `PORT`, `DATA_DIR`, `ADMIN_USERNAME`, `ADMIN_PASSWORD` and
    /// `JWT_SECRET` from the process environment.
    pub fn with_env(self) -> anyhow::Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides<F>(mut self, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = get("PORT") {
            self.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid PORT '{}': {}", port, e))?;
        }
        if let Some(dir) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        self.admin = AdminConfig {
            username: get("ADMIN_USERNAME"),
            password: get("ADMIN_PASSWORD"),
            jwt_secret: get("JWT_SECRET"),
        };

        Ok(self)
    }
}
