use crate::error::{HopperError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// DatabaseConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_kind")]
    pub kind: String,
    #[serde(default = "default_database_path")]
    pub path: Option<PathBuf>,
}

fn default_database_kind() -> String {
    "sqlite".to_string()
}

fn default_database_path() -> Option<PathBuf> {
    Some(PathBuf::from(paths::DATABASE_FILE))
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: default_database_kind(),
            path: default_database_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// InboxConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxConfig {
    #[serde(default = "default_master")]
    pub master: PathBuf,
    #[serde(default = "default_containers")]
    pub containers: PathBuf,
}

fn default_master() -> PathBuf {
    PathBuf::from(paths::MASTER_INBOX_DIR)
}

fn default_containers() -> PathBuf {
    PathBuf::from(paths::CONTAINER_INBOXES_DIR)
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            master: default_master(),
            containers: default_containers(),
        }
    }
}

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

/// Private registry images are pulled from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "https".to_string()
}

// ---------------------------------------------------------------------------
// DockerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_start_retries")]
    pub start_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_removal_interval_secs")]
    pub removal_interval_secs: u64,
    #[serde(default = "default_topic_label")]
    pub topic_label: String,
    #[serde(default = "default_container_inbox")]
    pub container_inbox: String,
}

fn default_timeout_secs() -> u64 {
    2
}
fn default_start_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_monitor_interval_secs() -> u64 {
    5
}
fn default_removal_interval_secs() -> u64 {
    10
}
fn default_topic_label() -> String {
    "hopper.topic".to_string()
}
fn default_container_inbox() -> String {
    "/inbox".to_string()
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            start_retries: default_start_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            monitor_interval_secs: default_monitor_interval_secs(),
            removal_interval_secs: default_removal_interval_secs(),
            topic_label: default_topic_label(),
            container_inbox: default_container_inbox(),
        }
    }
}

impl DockerConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn removal_interval(&self) -> Duration {
        Duration::from_secs(self.removal_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// OrchestratorConfig / ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

fn default_tick_interval_secs() -> u64 {
    10
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthConfig
// ---------------------------------------------------------------------------

/// API authentication. Without a `token_secret` every route is open.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

fn default_token_ttl_secs() -> u64 {
    3600
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_secret: None,
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token_secret", &self.token_secret.as_ref().map(|_| "[REDACTED]"))
            .field("token_ttl_secs", &self.token_ttl_secs)
            .finish()
    }
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

/// Shortest `auth.token_secret` accepted without a warning.
const MIN_SECRET_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub inbox: InboxConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryConfig>,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(HopperError::ConfigNotFound(path.to_path_buf()));
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// Resolve `relative` against the directory holding the config file, so a
    /// config can be used from any working directory.
    pub fn resolve(config_path: &Path, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            return relative.to_path_buf();
        }
        match config_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(relative),
            _ => relative.to_path_buf(),
        }
    }

    /// Path of the SQLite database. Fails for anything that cannot be opened.
    pub fn database_path(&self) -> Result<&Path> {
        if self.database.kind != "sqlite" {
            return Err(HopperError::UnknownDatabase(self.database.kind.clone()));
        }
        match self.database.path.as_deref() {
            Some(p) if !p.as_os_str().is_empty() => Ok(p),
            _ => Err(HopperError::MissingDatabase),
        }
    }

    /// Fatal checks run before anything is started.
    pub fn check(&self) -> Result<()> {
        self.database_path().map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if let Err(e) = self.check() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: e.to_string(),
            });
        }

        if self.docker.start_retries == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "docker.start_retries is 0; containers are still attempted once".to_string(),
            });
        }

        for (key, value) in [
            ("docker.monitor_interval_secs", self.docker.monitor_interval_secs),
            ("docker.removal_interval_secs", self.docker.removal_interval_secs),
            ("orchestrator.tick_interval_secs", self.orchestrator.tick_interval_secs),
        ] {
            if value == 0 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("{key} is 0; the loop will spin as fast as it can"),
                });
            }
        }

        if let Some(registry) = &self.registry {
            if registry.host.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: "registry section has no host; credentials will not be used".to_string(),
                });
            }
        }

        if let Some(secret) = &self.auth.token_secret {
            if secret.len() < MIN_SECRET_LEN {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("auth.token_secret is shorter than {MIN_SECRET_LEN} characters"),
                });
            }
            if self.auth.token_ttl_secs == 0 {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: "auth.token_ttl_secs is 0; every issued token is already expired".to_string(),
                });
            }
        }

        if self.inbox.master == self.inbox.containers {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "inbox.master and inbox.containers must be different directories".to_string(),
            });
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn sections_default_when_missing() {
        let cfg: Config = serde_yaml::from_str("server:\n  port: 8080\n").unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.database.kind, "sqlite");
        assert_eq!(cfg.docker.start_retries, 3);
        assert_eq!(cfg.docker.retry_delay(), Duration::from_millis(500));
        assert_eq!(cfg.orchestrator.tick_interval(), Duration::from_secs(10));
        assert!(cfg.registry.is_none());
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(&dir.path().join("hopper.yaml")).unwrap_err();
        assert!(matches!(err, HopperError::ConfigNotFound(_)));
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hopper.yaml");
        let mut cfg = Config::default();
        cfg.registry = Some(RegistryConfig {
            host: "registry.example.com".into(),
            username: Some("u".into()),
            password: Some("p".into()),
            protocol: "https".into(),
        });
        cfg.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), cfg);
    }

    #[test]
    fn unknown_database_kind() {
        let cfg: Config = serde_yaml::from_str("database:\n  kind: postgres\n").unwrap();
        assert!(matches!(cfg.check(), Err(HopperError::UnknownDatabase(k)) if k == "postgres"));
        assert_eq!(cfg.validate()[0].level, WarnLevel::Error);
    }

    #[test]
    fn missing_database_path() {
        let cfg: Config = serde_yaml::from_str("database:\n  kind: sqlite\n  path: null\n").unwrap();
        assert!(matches!(cfg.check(), Err(HopperError::MissingDatabase)));
    }

    #[test]
    fn warns_on_zero_intervals() {
        let cfg: Config = serde_yaml::from_str(
            "docker:\n  start_retries: 0\n  monitor_interval_secs: 0\nregistry:\n  username: u\n",
        )
        .unwrap();
        let messages: Vec<_> = cfg.validate().into_iter().map(|w| w.message).collect();
        assert_eq!(messages.len(), 3, "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("monitor_interval_secs")));
        assert!(messages.iter().any(|m| m.contains("registry")));
    }

    #[test]
    fn auth_section() {
        let cfg: Config = serde_yaml::from_str("auth:\n  token_secret: short\n  token_ttl_secs: 0\n").unwrap();
        assert_eq!(cfg.auth.token_secret.as_deref(), Some("short"));
        let messages: Vec<_> = cfg.validate().into_iter().map(|w| w.message).collect();
        assert_eq!(messages.len(), 2, "{messages:?}");
        assert!(messages.iter().all(|m| m.starts_with("auth.")));
        assert!(!format!("{:?}", cfg.auth).contains("short"));

        let cfg = Config::default();
        assert!(cfg.auth.token_secret.is_none());
        assert_eq!(cfg.auth.token_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn resolves_relative_to_config_dir() {
        let cfg_path = Path::new("/etc/hopper/hopper.yaml");
        assert_eq!(
            Config::resolve(cfg_path, Path::new("hopper.db")),
            PathBuf::from("/etc/hopper/hopper.db")
        );
        assert_eq!(
            Config::resolve(cfg_path, Path::new("/data/hopper.db")),
            PathBuf::from("/data/hopper.db")
        );
        assert_eq!(
            Config::resolve(Path::new("hopper.yaml"), Path::new("hopper.db")),
            PathBuf::from("hopper.db")
        );
    }
}
