//! Configuration Vault – reads/writes `~/.tidepool/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tidepool_kernel::IntegrityGate;
use tidepool_runtime::AgentConfig;
use tidepool_types::ResourceLimits;

/// Persisted agent configuration stored in `~/.tidepool/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Account the device contributes on behalf of.
    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// SQLite database holding the catalog and all agent records.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_poll_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_backoff_secs")]
    pub error_backoff_secs: u64,
    #[serde(default = "default_vitals_secs")]
    pub vitals_interval_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_health_secs")]
    pub health_check_interval_secs: u64,

    /// Per-task wall-clock limit.  Unset means no limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_deadline_secs: Option<u64>,

    /// Task hashes that may run without a signature.
    #[serde(default)]
    pub allowed_hashes: Vec<String>,

    /// Hex-encoded Ed25519 keys whose task signatures are accepted.
    #[serde(default)]
    pub trusted_keys: Vec<String>,

    #[serde(default)]
    pub limits: ResourceLimits,
}

fn default_user_id() -> String {
    "local".to_string()
}
fn default_database_path() -> String {
    tidepool_dir(&home_dir())
        .join("tidepool.db")
        .to_string_lossy()
        .into_owned()
}
fn default_poll_secs() -> u64 {
    10
}
fn default_backoff_secs() -> u64 {
    30
}
fn default_vitals_secs() -> u64 {
    5
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_health_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            database_path: default_database_path(),
            poll_interval_secs: default_poll_secs(),
            error_backoff_secs: default_backoff_secs(),
            vitals_interval_secs: default_vitals_secs(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            health_check_interval_secs: default_health_secs(),
            task_deadline_secs: None,
            allowed_hashes: Vec::new(),
            trusted_keys: Vec::new(),
            limits: ResourceLimits::default(),
        }
    }
}

impl Config {
    /// Runtime configuration with this file's intervals applied.
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            error_backoff: Duration::from_secs(self.error_backoff_secs),
            vitals_interval: Duration::from_secs(self.vitals_interval_secs.max(1)),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs.max(1)),
            task_deadline: self.task_deadline_secs.map(Duration::from_secs),
            ..AgentConfig::default()
        }
    }

    pub fn integrity_gate(&self) -> Result<IntegrityGate, String> {
        IntegrityGate::from_config(
            self.allowed_hashes.iter().map(String::as_str),
            self.trusted_keys.iter().map(String::as_str),
        )
        .map_err(|e| format!("Invalid trusted key in config: {e}"))
    }

    /// Add `hash` to the allow-list unless it is already there.
    pub fn allow_hash(&mut self, hash: &str) -> bool {
        if self.allowed_hashes.iter().any(|h| h.eq_ignore_ascii_case(hash)) {
            return false;
        }
        self.allowed_hashes.push(hash.to_ascii_lowercase());
        true
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn tidepool_dir(home: &str) -> PathBuf {
    PathBuf::from(home).join(".tidepool")
}

/// Return the path to `~/.tidepool/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    tidepool_dir(home).join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `TIDEPOOL_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TIDEPOOL_USER_ID` | `user_id` |
/// | `TIDEPOOL_DATABASE` | `database_path` |
/// | `TIDEPOOL_MAX_CPU` | `limits.max_cpu_percent` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TIDEPOOL_USER_ID") {
        cfg.user_id = v;
    }
    if let Ok(v) = std::env::var("TIDEPOOL_DATABASE") {
        cfg.database_path = v;
    }
    if let Ok(v) = std::env::var("TIDEPOOL_MAX_CPU")
        && let Ok(cpu) = v.parse::<f64>()
        && (0.0..=100.0).contains(&cpu)
    {
        cfg.limits.max_cpu_percent = cpu;
    }
}

/// Save the config to disk, creating `~/.tidepool/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_keeps_limits_and_allow_list() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.user_id = "alice".into();
        cfg.limits.temperature_threshold_c = 40.0;
        cfg.task_deadline_secs = Some(120);
        cfg.allow_hash("ABCDEF");
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.user_id, "alice");
        assert_eq!(loaded.limits.temperature_threshold_c, 40.0);
        assert_eq!(loaded.task_deadline_secs, Some(120));
        assert_eq!(loaded.allowed_hashes, vec!["abcdef".to_string()]);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: Config = toml::from_str("user_id = \"bob\"\n").unwrap();
        assert_eq!(cfg.user_id, "bob");
        assert_eq!(cfg.poll_interval_secs, 10);
        assert_eq!(cfg.limits, ResourceLimits::default());
    }

    #[test]
    fn partial_limits_table_keeps_the_rest_of_the_file() {
        let raw = "user_id = \"bob\"\nallowed_hashes = [\"abc\"]\n\n[limits]\nmax_cpu_percent = 50.0\n";
        let cfg: Config = toml::from_str(raw).expect("partial limits parse");
        assert_eq!(cfg.user_id, "bob");
        assert_eq!(cfg.allowed_hashes, vec!["abc".to_string()]);
        assert_eq!(cfg.limits.max_cpu_percent, 50.0);
        assert_eq!(cfg.limits.max_memory_mb, 512);
        assert_eq!(cfg.limits.temperature_threshold_c, 45.0);
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn config_path_points_to_tidepool_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".tidepool"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn agent_config_uses_file_intervals() {
        let cfg = Config {
            poll_interval_secs: 2,
            task_deadline_secs: Some(9),
            ..Config::default()
        };
        let agent = cfg.agent_config();
        assert_eq!(agent.poll_interval, Duration::from_secs(2));
        assert_eq!(agent.task_deadline, Some(Duration::from_secs(9)));
        assert_eq!(agent.max_restart_attempts, 5);
    }

    #[test]
    fn allow_hash_dedupes_case_insensitively() {
        let mut cfg = Config::default();
        assert!(cfg.allow_hash("abc"));
        assert!(!cfg.allow_hash("ABC"));
        assert_eq!(cfg.allowed_hashes.len(), 1);
    }

    #[test]
    fn malformed_trusted_key_is_reported() {
        let cfg = Config {
            trusted_keys: vec!["not-hex".into()],
            ..Config::default()
        };
        assert!(cfg.integrity_gate().is_err());
    }

    #[test]
    fn apply_env_overrides_changes_user_and_cpu() {
        // SAFETY: the only test in this binary that touches these variables.
        unsafe {
            std::env::set_var("TIDEPOOL_USER_ID", "carol");
            std::env::set_var("TIDEPOOL_MAX_CPU", "40");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.user_id, "carol");
        assert_eq!(cfg.limits.max_cpu_percent, 40.0);

        unsafe { std::env::set_var("TIDEPOOL_MAX_CPU", "400") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.limits.max_cpu_percent, 25.0);

        unsafe {
            std::env::remove_var("TIDEPOOL_USER_ID");
            std::env::remove_var("TIDEPOOL_MAX_CPU");
        }
    }
}
