//! Shared monitoring configuration: the persisted document, validation with
//! defaults, and the snapshot-read / exclusive-update store.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

use crate::judge::{Availability, CheckKind};

/// Floor for the poll interval. Anything lower is clamped, never rejected.
pub const MIN_FREQUENCY_SECS: u64 = 10;

const DEFAULT_FREQUENCY_SECS: u64 = 30;
const DEFAULT_COOLDOWN_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to persist configuration: {0}")]
    WriteFailed(String),
}

fn default_frequency() -> u64 {
    DEFAULT_FREQUENCY_SECS
}

fn default_cooldown() -> u64 {
    DEFAULT_COOLDOWN_SECS
}

fn default_true() -> bool {
    true
}

/// Global settings shared by every target. Credentials left empty here can
/// still be supplied per channel entry or through the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_frequency")]
    pub frequency: u64,
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default)]
    pub telegram_chat_id: String,
    #[serde(default)]
    pub push_key: String,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub proxy_host: String,
    /// Fields written by other tools survive a round trip untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_FREQUENCY_SECS,
            telegram_bot_token: String::new(),
            telegram_chat_id: String::new(),
            push_key: String::new(),
            webhook_url: String::new(),
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            proxy_host: String::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// One monitored endpoint, keyed by its unique name in the document map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub check_kind: CheckKind,
    #[serde(default)]
    pub check_pattern: String,
    #[serde(default)]
    pub expected_result: Option<String>,
    /// Per-target poll interval override; the global frequency applies when unset.
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Escalate to the resolver service when the direct request is blocked.
    #[serde(default)]
    pub use_fallback: bool,
    /// Last observed availability, written back by the engine on transition.
    #[serde(default)]
    pub status: Option<Availability>,
    #[serde(default)]
    pub last_changed: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            url: String::new(),
            check_kind: CheckKind::default(),
            check_pattern: String::new(),
            expected_result: None,
            interval_secs: None,
            active: true,
            use_fallback: false,
            status: None,
            last_changed: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// A notification channel entry as persisted. Settings may be partial; empty
/// credentials fall back to the global section and then the environment at
/// dispatch time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// None means global scope; Some binds the channel to one target.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub body_template: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The whole persisted document. Targets live under `stock`, keyed by name.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MonitorConfig {
    #[serde(default)]
    pub config: GlobalSettings,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
    #[serde(default)]
    pub stock: BTreeMap<String, Target>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Normalizes defaults and rejects structurally impossible states. Partial
/// operator edits are filled in, never fatal.
fn validate(config: &mut MonitorConfig) -> Result<(), ConfigError> {
    if config.config.frequency < MIN_FREQUENCY_SECS {
        config.config.frequency = MIN_FREQUENCY_SECS;
    }
    for (name, target) in &config.stock {
        if target.url.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "target \"{name}\" has no url"
            )));
        }
        match target.check_kind {
            CheckKind::Text | CheckKind::Selector => {
                if target.check_pattern.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "target \"{name}\" uses a {} check but has no pattern",
                        target.check_kind
                    )));
                }
            }
            // An empty api-path pattern means "just reachable".
            CheckKind::ApiPath => {}
        }
    }
    Ok(())
}

/// Owns the mutable configuration. Readers get immutable `Arc` snapshots;
/// updates and reloads swap the snapshot atomically and persist with
/// write-temp-then-replace, so no reader ever observes a half-applied state.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<Arc<MonitorConfig>>,
}

impl ConfigStore {
    /// Loads the document at `path`, creating a default one if none exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            Self::load(&path)?
        } else {
            info!(path = %path.display(), "configuration file missing, creating default");
            let mut config = MonitorConfig::default();
            validate(&mut config)?;
            persist(&path, &config)?;
            config
        };
        Ok(Self {
            path,
            inner: RwLock::new(Arc::new(config)),
        })
    }

    fn load(path: &Path) -> Result<MonitorConfig, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: MonitorConfig = serde_json::from_str(&raw)?;
        validate(&mut config)?;
        Ok(config)
    }

    /// Returns the current snapshot. Callers never hold a live reference into
    /// the store, so a concurrent update cannot invalidate what they read.
    pub fn get(&self) -> Arc<MonitorConfig> {
        self.inner.read().unwrap().clone()
    }

    /// Applies `mutate` under exclusive access, validates, swaps the snapshot
    /// and persists. A failed persist leaves the in-memory update in place and
    /// surfaces `WriteFailed`; the state is correct but not yet durable.
    pub fn update<F>(&self, mutate: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut MonitorConfig),
    {
        let mut guard = self.inner.write().unwrap();
        let mut next = (**guard).clone();
        mutate(&mut next);
        validate(&mut next)?;
        *guard = Arc::new(next);
        let snapshot = guard.clone();
        persist(&self.path, &snapshot)
    }

    /// Re-reads the backing file and swaps the snapshot. On any failure the
    /// previous in-memory configuration remains authoritative.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let next = Self::load(&self.path)?;
        let mut guard = self.inner.write().unwrap();
        *guard = Arc::new(next);
        info!(path = %self.path.display(), "configuration reloaded");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn persist(path: &Path, config: &MonitorConfig) -> Result<(), ConfigError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .map_err(|e| ConfigError::WriteFailed(format!("{}: {e}", parent.display())))?;
    let body = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::WriteFailed(e.to_string()))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|e| ConfigError::WriteFailed(e.to_string()))?;
    tmp.write_all(body.as_bytes())
        .map_err(|e| ConfigError::WriteFailed(e.to_string()))?;
    tmp.persist(path)
        .map_err(|e| ConfigError::WriteFailed(e.to_string()))?;
    Ok(())
}
