use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

const API_KEY_ENV: &str = "OPLAKE_API_KEY";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub api_key: String,
    pub connection_id: i64,
    pub db_path: String,
    pub page_size: u32,
    pub rate_limit_rpm: u32,
    pub retry_attempts: u32,
    pub timeout_seconds: u64,
    pub max_pages_per_collection: u32,
    /// Restrict work package / time entry / version collection to these
    /// project ids. Empty means the whole instance.
    pub projects: Vec<i64>,
    /// Scheduler hints; parsed for the lease timeout, not acted on here.
    pub sync_interval_hours: u64,
    pub full_sync_interval_days: u64,
    pub type_mappings: BTreeMap<String, String>,
    pub status_mappings: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_url: String::new(),
            api_key: String::new(),
            connection_id: 1,
            db_path: "data/oplake.sqlite".into(),
            page_size: 100,
            rate_limit_rpm: 100,
            retry_attempts: 3,
            timeout_seconds: 30,
            max_pages_per_collection: 1000,
            projects: Vec::new(),
            sync_interval_hours: 6,
            full_sync_interval_days: 7,
            type_mappings: default_type_mappings(),
            status_mappings: default_status_mappings(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            cfg.api_key = key;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&mut self) -> Result<()> {
        while self.base_url.ends_with('/') {
            self.base_url.pop();
        }
        if self.base_url.is_empty() {
            bail!("config: base_url is required");
        }
        if self.api_key.is_empty() {
            bail!("config: api_key is required (or set {API_KEY_ENV})");
        }
        if self.page_size == 0 {
            bail!("config: page_size must be positive");
        }
        if self.rate_limit_rpm == 0 {
            bail!("config: rate_limit_rpm must be positive");
        }
        Ok(())
    }
}

fn default_type_mappings() -> BTreeMap<String, String> {
    [
        ("Feature", "REQUIREMENT"),
        ("Support", "REQUIREMENT"),
        ("Task", "REQUIREMENT"),
        ("Epic", "REQUIREMENT"),
        ("User Story", "REQUIREMENT"),
        ("Enhancement", "REQUIREMENT"),
        ("Story", "REQUIREMENT"),
        ("Summary task", "REQUIREMENT"),
        ("Phase", "REQUIREMENT"),
        ("Milestone", "REQUIREMENT"),
        ("Bug", "BUG"),
        ("Defect", "BUG"),
        ("Incident", "INCIDENT"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_status_mappings() -> BTreeMap<String, String> {
    [
        ("New", "TODO"),
        ("Open", "TODO"),
        ("On hold", "TODO"),
        ("Blocked", "TODO"),
        ("In progress", "DOING"),
        ("In development", "DOING"),
        ("In review", "DOING"),
        ("Testing", "DOING"),
        ("Closed", "DONE"),
        ("Resolved", "DONE"),
        ("Done", "DONE"),
        ("Completed", "DONE"),
        ("Rejected", "DONE"),
        ("Cancelled", "DONE"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            base_url: "https://op.example".into(),
            api_key: "secret".into(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_cover_taxonomy() {
        let cfg = Config::default();
        assert_eq!(cfg.type_mappings.get("Bug").map(String::as_str), Some("BUG"));
        assert_eq!(cfg.type_mappings.get("Incident").map(String::as_str), Some("INCIDENT"));
        assert_eq!(cfg.status_mappings.get("In progress").map(String::as_str), Some("DOING"));
        assert_eq!(cfg.status_mappings.get("Rejected").map(String::as_str), Some("DONE"));
    }

    #[test]
    fn validate_trims_trailing_slash() {
        let mut cfg = minimal();
        cfg.base_url = "https://op.example/".into();
        cfg.validate().unwrap();
        assert_eq!(cfg.base_url, "https://op.example");
    }

    #[test]
    fn validate_requires_credentials() {
        let mut cfg = minimal();
        cfg.api_key.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"base_url": "https://op.example", "api_key": "k", "connection_id": 3}"#,
        )
        .unwrap();
        assert_eq!(cfg.connection_id, 3);
        assert_eq!(cfg.page_size, 100);
        assert_eq!(cfg.max_pages_per_collection, 1000);
        assert!(!cfg.status_mappings.is_empty());
    }
}
