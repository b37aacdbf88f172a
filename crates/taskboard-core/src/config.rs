use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::error::ErrorCode;
use crate::optimistic::ExpiryPolicy;

/// Environment variable overriding `history.max_size`.
pub const HISTORY_LIMIT_ENV: &str = "TASKBOARD_HISTORY_LIMIT";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub optimistic: OptimisticConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Maximum number of undoable changes kept.
    #[serde(default = "default_history_size")]
    pub max_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_size: default_history_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimisticConfig {
    /// Seconds before an unconfirmed optimistic update is presumed abandoned.
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
    #[serde(default)]
    pub on_expiry: ExpiryPolicy,
}

impl OptimisticConfig {
    #[must_use]
    pub const fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_expiry_secs(),
            on_expiry: ExpiryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Minimum minutes a high-priority task must sit in review before done.
    #[serde(default = "default_review_dwell_minutes")]
    pub review_dwell_minutes: i64,
}

impl WorkflowConfig {
    #[must_use]
    pub fn review_dwell(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.review_dwell_minutes)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            review_dwell_minutes: default_review_dwell_minutes(),
        }
    }
}

/// Load `<root>/.taskboard/config.toml`, falling back to defaults when the
/// file does not exist, then apply environment overrides.
pub fn load_config(root: &Path) -> Result<CoreConfig> {
    let path = root.join(".taskboard/config.toml");
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str::<CoreConfig>(&content)
            .with_context(|| {
                format!("{}: failed to parse {}", ErrorCode::ConfigParseError, path.display())
            })?
    } else {
        CoreConfig::default()
    };

    apply_history_override(&mut config, env::var(HISTORY_LIMIT_ENV).ok())?;
    config.history.max_size = config.history.max_size.max(1);
    Ok(config)
}

fn apply_history_override(config: &mut CoreConfig, raw: Option<String>) -> Result<()> {
    let Some(raw) = raw else {
        return Ok(());
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(());
    }
    config.history.max_size = trimmed
        .parse()
        .with_context(|| format!("{HISTORY_LIMIT_ENV} must be a positive integer, got '{raw}'"))?;
    Ok(())
}

const fn default_history_size() -> usize {
    50
}

const fn default_expiry_secs() -> u64 {
    30
}

const fn default_review_dwell_minutes() -> i64 {
    5
}
