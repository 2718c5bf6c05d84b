use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::{
    Classifier, DuplicateMessageIdPolicy, MarkerHeaderPolicy, APPLE_AUTO_SAVE_HEADER,
};
use crate::error::{MailboxError, Result};
use crate::rate_limiter::window_cost;

/// Largest batch the remote batch endpoint accepts
pub const MAX_BATCH_GET: usize = 100;
/// Largest id list `messages.batchDelete` accepts
pub const MAX_BATCH_DELETE: usize = 1000;
/// Largest page `messages.list` returns
pub const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_query")]
    pub query: Option<String>,
    /// Label name, resolved to an id at startup
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            query: default_query(),
            label: None,
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    MarkerHeader,
    DuplicateMessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub kind: PolicyKind,
    #[serde(default = "default_header_name")]
    pub header_name: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            kind: PolicyKind::default(),
            header_name: default_header_name(),
        }
    }
}

impl PolicyConfig {
    pub fn build(&self) -> Box<dyn Classifier> {
        match self.kind {
            PolicyKind::MarkerHeader => Box::new(MarkerHeaderPolicy::new(self.header_name.clone())),
            PolicyKind::DuplicateMessageId => Box::new(DuplicateMessageIdPolicy::new()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_batch_get_size")]
    pub batch_get_size: usize,
    #[serde(default = "default_batch_delete_size")]
    pub batch_delete_size: usize,
    #[serde(default = "default_calls_per_second")]
    pub calls_per_second: u32,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    #[serde(default = "default_max_item_retries")]
    pub max_item_retries: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    #[serde(default = "default_quota_units_per_second")]
    pub quota_units_per_second: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            batch_get_size: default_batch_get_size(),
            batch_delete_size: default_batch_delete_size(),
            calls_per_second: default_calls_per_second(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            max_item_retries: default_max_item_retries(),
            cooldown_secs: default_cooldown_secs(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            quota_units_per_second: default_quota_units_per_second(),
        }
    }
}

impl LimitsConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Headers requested for every message, on top of what the policy needs
    #[serde(default = "default_header_allowlist")]
    pub header_allowlist: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            header_allowlist: default_header_allowlist(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,
    /// Loop iterations between checkpoint writes
    #[serde(default = "default_checkpoint_interval")]
    pub interval: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            interval: default_checkpoint_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub dry_run: bool,
}

fn default_query() -> Option<String> {
    Some("-label:INBOX".to_string())
}

fn default_page_size() -> u32 {
    100
}

fn default_header_name() -> String {
    APPLE_AUTO_SAVE_HEADER.to_string()
}

fn default_batch_get_size() -> usize {
    30
}

fn default_batch_delete_size() -> usize {
    45
}

fn default_calls_per_second() -> u32 {
    1
}

fn default_max_consecutive_failures() -> u32 {
    4
}

fn default_max_rate_limit_retries() -> u32 {
    16
}

fn default_max_item_retries() -> u32 {
    8
}

fn default_cooldown_secs() -> u64 {
    1
}

fn default_max_concurrent_fetches() -> usize {
    10
}

fn default_quota_units_per_second() -> u64 {
    250
}

fn default_header_allowlist() -> Vec<String> {
    vec!["Subject".to_string(), "Date".to_string(), "To".to_string()]
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from(".gmail-cleanup/state.json")
}

fn default_checkpoint_interval() -> u64 {
    10
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MailboxError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| MailboxError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                MailboxError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| MailboxError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| MailboxError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Source
        if self.source.page_size == 0 {
            return Err(MailboxError::ConfigError(
                "source.page_size must be at least 1".to_string(),
            ));
        }
        if self.source.page_size > MAX_PAGE_SIZE {
            return Err(MailboxError::ConfigError(format!(
                "source.page_size cannot exceed {}",
                MAX_PAGE_SIZE
            )));
        }
        if matches!(self.source.label.as_deref(), Some(label) if label.trim().is_empty()) {
            return Err(MailboxError::ConfigError(
                "source.label cannot be empty".to_string(),
            ));
        }

        // Policy
        if self.policy.kind == PolicyKind::MarkerHeader && self.policy.header_name.trim().is_empty() {
            return Err(MailboxError::ConfigError(
                "policy.header_name cannot be empty".to_string(),
            ));
        }

        // Batch sizes are bounded by the remote endpoints
        let limits = &self.limits;
        if limits.batch_get_size == 0 {
            return Err(MailboxError::ConfigError(
                "limits.batch_get_size must be at least 1".to_string(),
            ));
        }
        if limits.batch_get_size > MAX_BATCH_GET {
            return Err(MailboxError::ConfigError(format!(
                "limits.batch_get_size cannot exceed {}",
                MAX_BATCH_GET
            )));
        }
        if limits.batch_delete_size == 0 {
            return Err(MailboxError::ConfigError(
                "limits.batch_delete_size must be at least 1".to_string(),
            ));
        }
        if limits.batch_delete_size > MAX_BATCH_DELETE {
            return Err(MailboxError::ConfigError(format!(
                "limits.batch_delete_size cannot exceed {}",
                MAX_BATCH_DELETE
            )));
        }

        for (name, value) in [
            ("calls_per_second", limits.calls_per_second as u64),
            ("max_consecutive_failures", limits.max_consecutive_failures as u64),
            ("max_rate_limit_retries", limits.max_rate_limit_retries as u64),
            ("max_item_retries", limits.max_item_retries as u64),
            ("max_concurrent_fetches", limits.max_concurrent_fetches as u64),
            ("quota_units_per_second", limits.quota_units_per_second),
        ] {
            if value == 0 {
                return Err(MailboxError::ConfigError(format!(
                    "limits.{} must be greater than 0",
                    name
                )));
            }
        }

        let cost = window_cost(limits.calls_per_second, limits.batch_get_size);
        if cost > limits.quota_units_per_second {
            return Err(MailboxError::ConfigError(format!(
                "limits exceed the quota budget: {} calls/s with batch_get_size {} costs {} units/s, budget is {}",
                limits.calls_per_second, limits.batch_get_size, cost, limits.quota_units_per_second
            )));
        }

        // Fetch
        for header in &self.fetch.header_allowlist {
            if header.trim().is_empty() {
                return Err(MailboxError::ConfigError(
                    "fetch.header_allowlist cannot contain empty strings".to_string(),
                ));
            }
        }

        // Checkpoint
        if self.checkpoint.interval == 0 {
            return Err(MailboxError::ConfigError(
                "checkpoint.interval must be greater than 0".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Configured allowlist plus the headers the selected policy reads
    pub fn effective_header_allowlist(&self, classifier: &dyn Classifier) -> Vec<String> {
        merge_headers(&self.fetch.header_allowlist, &classifier.required_headers())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}

/// Union of two header lists, first occurrence wins, names compared case-insensitively
pub fn merge_headers(base: &[String], extra: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(base.len() + extra.len());
    for header in base.iter().chain(extra) {
        if !merged.iter().any(|h| h.eq_ignore_ascii_case(header)) {
            merged.push(header.clone());
        }
    }
    merged
}
