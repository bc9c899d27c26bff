use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/session-engine.toml";

/// Top-level configuration for the session engine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub transactions: TransactionConfig,
    #[serde(default)]
    pub tenants: TenantConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Number of independent lock domains. Fixed for the process lifetime.
    #[serde(default = "default_pipelines")]
    pub pipelines: usize,
    /// Expiry applied when a client asks for "never expire" (-1).
    #[serde(default = "default_expiry_secs")]
    pub default_expiry_secs: u64,
    /// Extra slack on top of the transport keep-alive before the session is considered idle.
    #[serde(default = "default_keep_alive_grace_ms")]
    pub keep_alive_grace_ms: u64,
    #[serde(default)]
    pub max_expiry_secs: Option<u64>,
    /// Messages buffered per subscription while it cannot deliver.
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pipelines: default_pipelines(),
            default_expiry_secs: default_expiry_secs(),
            keep_alive_grace_ms: default_keep_alive_grace_ms(),
            max_expiry_secs: None,
            backlog_limit: default_backlog_limit(),
        }
    }
}

impl SessionConfig {
    pub fn keep_alive_grace(&self) -> Duration {
        Duration::from_millis(self.keep_alive_grace_ms)
    }

    /// Resolve a client requested expiry into seconds.
    ///
    /// Negative values request the configured default, everything else is
    /// clamped to `max_expiry_secs` when set.
    pub fn resolve_expiry(&self, requested: i64) -> u64 {
        let secs = if requested < 0 {
            self.default_expiry_secs
        } else {
            requested as u64
        };
        match self.max_expiry_secs {
            Some(max) => secs.min(max),
            None => secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionConfig {
    #[serde(default = "default_txn_expiry_ms")]
    pub expiry_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            expiry_ms: default_txn_expiry_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl TransactionConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantConfig {
    #[serde(default)]
    pub entries: Vec<TenantEntry>,
}

impl TenantConfig {
    /// Reject user namespace roots that sit under a global root: names in
    /// such a tenant would be taken for global ones on the way back out.
    fn check_overlap(&self) -> Result<()> {
        let globals: Vec<&str> = self
            .entries
            .iter()
            .filter(|e| e.scope == TenantScope::Global && e.namespace_root.len() > 1)
            .map(|e| e.namespace_root.as_str())
            .collect();
        for entry in self.entries.iter().filter(|e| e.scope == TenantScope::User) {
            let fixed = entry
                .namespace_root
                .split('{')
                .next()
                .unwrap_or_default();
            if let Some(global) = globals.iter().find(|g| !fixed.is_empty() && fixed.starts_with(*g)) {
                bail!(
                    "tenant {} namespace root {} lies under global root {}",
                    entry.name,
                    entry.namespace_root,
                    global
                );
            }
        }
        Ok(())
    }
}

/// One namespace rule. `user` entries are matched by username (with a
/// `default` fallback); `global` entries list roots shared by every tenant.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TenantEntry {
    pub name: String,
    pub namespace_root: String,
    pub scope: TenantScope,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TenantScope {
    User,
    Global,
}

impl FromStr for TenantScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "global" => Ok(Self::Global),
            other => bail!("invalid tenant scope {}", other),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Directory for persisted session and will state. `None` keeps everything in memory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub log_level: Option<String>,
}

fn default_pipelines() -> usize {
    8
}

fn default_expiry_secs() -> u64 {
    24 * 60 * 60
}

fn default_keep_alive_grace_ms() -> u64 {
    5_000
}

fn default_backlog_limit() -> usize {
    10_000
}

fn default_txn_expiry_ms() -> u64 {
    3_600_000
}

fn default_sweep_interval_ms() -> u64 {
    100
}

impl EngineConfig {
    /// Load configuration from SESSION_ENGINE_CONFIG or `config/session-engine.toml`,
    /// then apply environment overrides.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sessions.pipelines == 0 {
            bail!("sessions.pipelines must be greater than zero");
        }
        if self.transactions.sweep_interval_ms == 0 {
            bail!("transactions.sweep_interval_ms must be greater than zero");
        }
        if self.sessions.backlog_limit == 0 {
            bail!("sessions.backlog_limit must be greater than zero");
        }
        for entry in &self.tenants.entries {
            if entry.name.is_empty() {
                bail!("tenant entry with empty name");
            }
        }
        self.tenants.check_overlap()?;
        if let Some(dir) = &self.storage.data_dir {
            if dir.exists() && !dir.is_dir() {
                bail!("storage.data_dir {} is not a directory", dir.display());
            }
        }
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(pipelines) = std::env::var("SESSION_ENGINE_PIPELINES") {
            self.sessions.pipelines = pipelines
                .parse()
                .with_context(|| format!("invalid SESSION_ENGINE_PIPELINES {pipelines}"))?;
        }
        if let Ok(dir) = std::env::var("SESSION_ENGINE_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(level) = std::env::var("SESSION_ENGINE_LOG_LEVEL") {
            self.telemetry.log_level = Some(level);
        }
        Ok(())
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("SESSION_ENGINE_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.sessions.pipelines, 8);
        assert_eq!(cfg.sessions.default_expiry_secs, 86_400);
        assert_eq!(cfg.transactions.expiry(), Duration::from_secs(3600));
        assert!(cfg.storage.data_dir.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn tenants_parse_from_toml() {
        let doc = r#"
[sessions]
pipelines = 4

[[tenants.entries]]
name = "default"
namespace_root = "/tenants/{user}"
scope = "user"

[[tenants.entries]]
name = "shared"
namespace_root = "/global"
scope = "global"
"#;
        let cfg: EngineConfig = toml::from_str(doc).unwrap();
        assert_eq!(cfg.sessions.pipelines, 4);
        assert_eq!(cfg.tenants.entries.len(), 2);
        assert_eq!(cfg.tenants.entries[1].scope, TenantScope::Global);
    }

    #[test]
    fn json_config_is_detected_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{"transactions": {"expiry_ms": 500}}"#).unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.transactions.expiry_ms, 500);
        assert_eq!(cfg.transactions.sweep_interval_ms, 100);
    }

    #[test]
    fn zero_pipelines_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.sessions.pipelines = 0;
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:?}").contains("pipelines"));
    }

    #[test]
    fn expiry_resolution_applies_default_and_clamp() {
        let mut sessions = SessionConfig::default();
        assert_eq!(sessions.resolve_expiry(-1), 86_400);
        assert_eq!(sessions.resolve_expiry(30), 30);
        sessions.max_expiry_secs = Some(10);
        assert_eq!(sessions.resolve_expiry(30), 10);
        assert_eq!(sessions.resolve_expiry(-1), 10);
    }

    #[test]
    fn tenant_under_global_root_rejected() {
        let doc = r#"
[[tenants.entries]]
name = "acme"
namespace_root = "shared/acme/{user}"
scope = "user"

[[tenants.entries]]
name = "shared"
namespace_root = "shared/"
scope = "global"
"#;
        let cfg: EngineConfig = toml::from_str(doc).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err}").contains("global root shared/"));

        let mut cfg = cfg;
        cfg.tenants.entries[0].namespace_root = "tenants/{user}".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_backlog_limit_rejected() {
        let mut cfg = EngineConfig::default();
        assert_eq!(cfg.sessions.backlog_limit, 10_000);
        cfg.sessions.backlog_limit = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn scope_from_str() {
        assert_eq!(TenantScope::from_str("Global").unwrap(), TenantScope::Global);
        assert!(TenantScope::from_str("realm").is_err());
    }
}
