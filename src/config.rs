use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::feed::DEFAULT_MAX_ENTRIES;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory holding settings.json, feeds.json and news.json
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Background refresh interval in minutes, 0 disables it
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_feeds")]
    pub max_feeds: usize,
    /// Installed as the feed list on first start
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_refresh_interval() -> u64 {
    15
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

fn default_max_feeds() -> usize {
    50
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_active")]
    pub active: bool,
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
}
