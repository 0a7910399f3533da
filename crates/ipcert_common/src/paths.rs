//! Path helpers for ipcert
//!
//! Every fixed location lives here. `Layout` resolves them against a root
//! directory so tests (and `IPCERT_ROOT`) can redirect the whole tree.

use std::path::{Path, PathBuf};

/// Environment variable that relocates the filesystem root
pub const ROOT_ENV: &str = "IPCERT_ROOT";

pub const CONFIG_DIR: &str = "/etc/ipcert";
pub const CONFIG_FILE: &str = "/etc/ipcert/config.toml";
pub const LOG_DIR: &str = "/var/log/ipcert";
pub const BACKUP_DIR: &str = "/var/lib/ipcert/backups";
pub const LOCK_FILE: &str = "/var/run/ipcert.lock";

/// certbot's own state; read and snapshotted, never edited in place
pub const CERTBOT_CONFIG_DIR: &str = "/etc/letsencrypt";
pub const CERTBOT_LOG_DIR: &str = "/var/log/letsencrypt";
pub const CERTBOT_VENV_DIR: &str = "/opt/ipcert/certbot";
pub const CERTBOT_LINK: &str = "/usr/local/bin/certbot";

pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";
pub const INIT_D_DIR: &str = "/etc/init.d";
pub const BSD_RC_DIR: &str = "/usr/local/etc/rc.d";
pub const LAUNCHD_DIR: &str = "/Library/LaunchDaemons";
pub const CRON_D_DIR: &str = "/etc/cron.d";

/// Filesystem layout rooted at `/` in production
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Layout for the running host, honouring `IPCERT_ROOT`
    pub fn system() -> Self {
        match std::env::var_os(ROOT_ENV) {
            Some(root) if !root.is_empty() => Self::with_root(root),
            _ => Self::with_root("/"),
        }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an absolute host path into this layout
    pub fn resolve(&self, absolute: &str) -> PathBuf {
        self.root.join(absolute.trim_start_matches('/'))
    }

    pub fn config_dir(&self) -> PathBuf {
        self.resolve(CONFIG_DIR)
    }

    pub fn config_file(&self) -> PathBuf {
        self.resolve(CONFIG_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.resolve(LOG_DIR)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.resolve(BACKUP_DIR)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.resolve(LOCK_FILE)
    }

    pub fn certbot_config_dir(&self) -> PathBuf {
        self.resolve(CERTBOT_CONFIG_DIR)
    }

    pub fn certbot_log_dir(&self) -> PathBuf {
        self.resolve(CERTBOT_LOG_DIR)
    }

    pub fn certbot_venv_dir(&self) -> PathBuf {
        self.resolve(CERTBOT_VENV_DIR)
    }

    pub fn certbot_link(&self) -> PathBuf {
        self.resolve(CERTBOT_LINK)
    }

    pub fn systemd_unit_dir(&self) -> PathBuf {
        self.resolve(SYSTEMD_UNIT_DIR)
    }

    pub fn init_d_dir(&self) -> PathBuf {
        self.resolve(INIT_D_DIR)
    }

    pub fn bsd_rc_dir(&self) -> PathBuf {
        self.resolve(BSD_RC_DIR)
    }

    pub fn launchd_dir(&self) -> PathBuf {
        self.resolve(LAUNCHD_DIR)
    }

    pub fn cron_d_dir(&self) -> PathBuf {
        self.resolve(CRON_D_DIR)
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::system()
    }
}

/// Whether the effective user is root
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_layout_paths() {
        let layout = Layout::with_root("/");
        assert_eq!(layout.config_file(), PathBuf::from("/etc/ipcert/config.toml"));
        assert_eq!(layout.lock_file(), PathBuf::from("/var/run/ipcert.lock"));
    }

    #[test]
    fn test_rooted_layout_stays_inside_root() {
        let layout = Layout::with_root("/tmp/ipcert-test");
        assert_eq!(
            layout.backup_dir(),
            PathBuf::from("/tmp/ipcert-test/var/lib/ipcert/backups")
        );
        assert!(layout.cron_d_dir().starts_with("/tmp/ipcert-test"));
    }
}
