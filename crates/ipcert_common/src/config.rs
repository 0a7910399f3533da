//! ipcert configuration
//!
//! Configuration lives in /etc/ipcert/config.toml. The file is read once at
//! startup, overlaid on the compiled-in defaults below and validated as a
//! unit; components receive `&Config` and never re-read it.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backup::{BackupKind, BackupManager};
use crate::error::{IpcertError, Result};
use crate::validation::{self, PathPolicy};

/// Log levels accepted in `[logging] level`
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

// ============================================================================
// Value types
// ============================================================================

/// RSA key size passed to certbot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u32", into = "u32")]
pub enum KeySize {
    Rsa2048,
    #[default]
    Rsa4096,
}

impl KeySize {
    pub fn bits(&self) -> u32 {
        match self {
            KeySize::Rsa2048 => 2048,
            KeySize::Rsa4096 => 4096,
        }
    }
}

impl TryFrom<u32> for KeySize {
    type Error = String;

    fn try_from(bits: u32) -> std::result::Result<Self, Self::Error> {
        match bits {
            2048 => Ok(KeySize::Rsa2048),
            4096 => Ok(KeySize::Rsa4096),
            other => Err(format!("key_size must be 2048 or 4096, got {}", other)),
        }
    }
}

impl From<KeySize> for u32 {
    fn from(size: KeySize) -> u32 {
        size.bits()
    }
}

/// Which web server integration to use for the HTTP-01 challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WebServerPreference {
    /// Detect a running nginx/apache, else standalone
    #[default]
    Auto,
    Nginx,
    Apache,
    Standalone,
}

impl WebServerPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebServerPreference::Auto => "auto",
            WebServerPreference::Nginx => "nginx",
            WebServerPreference::Apache => "apache",
            WebServerPreference::Standalone => "standalone",
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertificateConfig {
    /// Account email registered with the CA
    #[serde(default)]
    pub email: Option<String>,

    /// Document root served on port 80
    #[serde(default = "default_webroot")]
    pub webroot: String,

    #[serde(default)]
    pub key_size: KeySize,

    #[serde(default)]
    pub web_server: WebServerPreference,
}

fn default_webroot() -> String {
    "/var/www/html".to_string()
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            email: None,
            webroot: default_webroot(),
            key_size: KeySize::default(),
            web_server: WebServerPreference::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenewalConfig {
    /// Whether scheduled renewals run at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Install the renewal job right after a successful issuance
    #[serde(default)]
    pub auto_setup: bool,

    /// Replaces the built-in web server reload chain
    #[serde(default)]
    pub deploy_hook: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_setup: false,
            deploy_hook: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Days to keep rotated log files (valid: 1-365)
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_retention_days() -> u64 {
    30
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            retention_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    /// Snapshots kept per backup type (valid: 1-1000)
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

fn default_max_backups() -> usize {
    10
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_backups: default_max_backups(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// How long to wait for another operation to finish
    #[serde(default = "default_lock_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_lock_poll")]
    pub poll_secs: u64,
}

fn default_lock_timeout() -> u64 {
    300 // 5 minutes
}

fn default_lock_poll() -> u64 {
    5
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_lock_timeout(),
            poll_secs: default_lock_poll(),
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub certificate: CertificateConfig,

    #[serde(default)]
    pub renewal: RenewalConfig,

    #[serde(default)]
    pub logging: LogConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub lock: LockConfig,
}

impl Config {
    /// Parse TOML text (missing keys take defaults) and validate
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| IpcertError::ConfigCorrupt(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| IpcertError::ConfigCorrupt(e.to_string()))
    }

    /// Validate every field together
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if let Some(email) = &self.certificate.email {
            if let Err(e) = validation::validate_email(email) {
                problems.push(format!("certificate.email: {}", e));
            }
        }
        if let Err(e) = validation::validate_path(&self.certificate.webroot, PathPolicy::SystemAbsolute)
        {
            problems.push(format!("certificate.webroot: {}", e));
        }
        if let Some(hook) = &self.renewal.deploy_hook {
            if hook.trim().is_empty() || hook.contains('\n') || hook.contains('\0') {
                problems.push("renewal.deploy_hook must be a single non-empty line".to_string());
            }
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            problems.push(format!(
                "logging.level '{}' is not one of {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            ));
        }
        if !(1..=365).contains(&self.logging.retention_days) {
            problems.push("logging.retention_days must be 1-365".to_string());
        }
        if !(1..=1000).contains(&self.backup.max_backups) {
            problems.push("backup.max_backups must be 1-1000".to_string());
        }
        if self.lock.poll_secs == 0 || self.lock.poll_secs > self.lock.timeout_secs.max(1) {
            problems.push("lock.poll_secs must be between 1 and lock.timeout_secs".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(IpcertError::ConfigCorrupt(problems.join("; ")))
        }
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Reads and writes the config file
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load the file, or defaults when it does not exist yet
    pub fn load(&self) -> Result<Config> {
        if !self.path.exists() {
            info!("No config at {}, using defaults", self.path.display());
            return Ok(Config::default());
        }
        let text = fs::read_to_string(&self.path).map_err(|e| IpcertError::io(&self.path, e))?;
        Config::from_toml_str(&text)
    }

    /// Save `config`, taking a config backup of the current file first.
    ///
    /// A failed backup blocks the save so the last known-good file is never
    /// overwritten without a fallback.
    pub fn save(&self, config: &Config, backups: &BackupManager) -> Result<()> {
        config.validate()?;

        if self.path.exists() {
            backups.backup(&self.path, BackupKind::Config).map_err(|e| {
                warn!("Refusing to save config: pre-save backup failed: {}", e);
                e
            })?;
        }

        let dir = self
            .path
            .parent()
            .ok_or_else(|| IpcertError::ConfigCorrupt("config path has no parent".to_string()))?;
        // Only a directory created here is tightened; a shared parent such
        // as /etc keeps its mode
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| IpcertError::io(dir, e))?;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| IpcertError::io(dir, e))?;
        }

        let text = config.to_toml_string()?;
        let tmp = self.path.with_extension("toml.tmp");
        {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)
                .map_err(|e| IpcertError::io(&tmp, e))?;
            file.write_all(text.as_bytes())
                .and_then(|_| file.sync_all())
                .map_err(|e| IpcertError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| IpcertError::io(&self.path, e))?;

        info!(target: "audit", "configuration saved to {}", self.path.display());
        Ok(())
    }
}
