//! Command line surface
//!
//! The interface is flag based (`ipcertctl --renew`, `ipcertctl -i ADDR ...`)
//! so scheduled jobs and existing wrappers keep a stable command line.
//! Exactly one action may be given; none prints help.

use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use ipcert_common::{BackupKind, KeySize};

#[derive(Parser, Debug)]
#[command(name = "ipcertctl")]
#[command(about = "Short-lived Let's Encrypt certificates for IP addresses", long_about = None)]
#[command(disable_version_flag = true)]
#[command(group(
    ArgGroup::new("action")
        .multiple(false)
        .args([
            "ip", "install", "renew", "force_renew", "setup_renewal", "list",
            "check_profiles", "backup", "restore", "emergency", "status",
            "integrity_check", "show_config", "setup", "configure", "version",
        ])
))]
pub struct Cli {
    /// Public IP address to request a certificate for
    #[arg(short = 'i', long, value_name = "ADDR")]
    pub ip: Option<String>,

    /// Contact email for the ACME account (defaults to the configured one)
    #[arg(short = 'e', long, value_name = "EMAIL", requires = "ip")]
    pub email: Option<String>,

    /// Webroot served on port 80 (defaults to the configured one)
    #[arg(short = 'w', long, value_name = "PATH", requires = "ip")]
    pub webroot: Option<String>,

    /// RSA key size for this request: 2048 or 4096
    #[arg(long, value_name = "BITS", value_parser = parse_key_size, requires = "ip")]
    pub key_size: Option<KeySize>,

    /// Install dependencies and a recent certbot
    #[arg(long)]
    pub install: bool,

    /// Renew certificates that are due (dry-run first)
    #[arg(long)]
    pub renew: bool,

    /// Renew every certificate now (dry-run first)
    #[arg(long)]
    pub force_renew: bool,

    /// Sleep a random 0..SECONDS before renewing
    #[arg(long, value_name = "SECONDS")]
    pub jitter: Option<u64>,

    /// Install the recurring renewal jobs
    #[arg(long)]
    pub setup_renewal: bool,

    /// List certificates known to certbot
    #[arg(long)]
    pub list: bool,

    /// Show the ACME profiles the CA advertises
    #[arg(long)]
    pub check_profiles: bool,

    /// Take a manual backup of the configuration and certificates
    #[arg(long)]
    pub backup: bool,

    /// Restore a backup (the newest unless NAME is given)
    #[arg(long, value_name = "NAME", num_args = 0..=1)]
    pub restore: Option<Option<String>>,

    /// Backup type used by --restore: config or manual
    #[arg(long, value_name = "TYPE", value_parser = parse_backup_kind, default_value = "config")]
    pub restore_type: BackupKind,

    /// Emergency recovery: stop jobs, snapshot state, interactive menu
    #[arg(long)]
    pub emergency: bool,

    /// Show environment, certbot, renewal and backup status
    #[arg(long)]
    pub status: bool,

    /// Read-only health check
    #[arg(long)]
    pub integrity_check: bool,

    /// Print the effective configuration
    #[arg(long)]
    pub show_config: bool,

    /// Interactive first-time setup
    #[arg(long)]
    pub setup: bool,

    /// Interactive configuration editor
    #[arg(long)]
    pub configure: bool,

    /// Print version
    #[arg(short = 'v', long)]
    pub version: bool,

    /// Verbose logging to the terminal
    #[arg(long)]
    pub debug: bool,

    /// Alternative configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// Certificate request taken from the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueArgs {
    pub ip: String,
    pub email: Option<String>,
    pub webroot: Option<String>,
    pub key_size: Option<KeySize>,
}

/// The single action selected on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Issue(IssueArgs),
    Install,
    Renew { force: bool, jitter: u64 },
    SetupRenewal,
    List,
    CheckProfiles,
    Backup,
    Restore { kind: BackupKind, name: Option<String> },
    Emergency,
    Status,
    IntegrityCheck,
    ShowConfig,
    Setup,
    Configure,
    Version,
    Help,
}

impl Command {
    /// Commands that change host state and therefore need root
    pub fn requires_root(&self) -> bool {
        !matches!(
            self,
            Command::Status
                | Command::IntegrityCheck
                | Command::ShowConfig
                | Command::CheckProfiles
                | Command::Version
                | Command::Help
        )
    }
}

impl Cli {
    /// The single action the flags select
    pub fn action(&self) -> Command {
        if let Some(ip) = &self.ip {
            return Command::Issue(IssueArgs {
                ip: ip.clone(),
                email: self.email.clone(),
                webroot: self.webroot.clone(),
                key_size: self.key_size,
            });
        }
        if self.renew || self.force_renew {
            return Command::Renew {
                force: self.force_renew,
                jitter: self.jitter.unwrap_or(0),
            };
        }
        if let Some(name) = &self.restore {
            return Command::Restore {
                kind: self.restore_type,
                name: name.clone(),
            };
        }

        let flags = [
            (self.install, Command::Install),
            (self.setup_renewal, Command::SetupRenewal),
            (self.list, Command::List),
            (self.check_profiles, Command::CheckProfiles),
            (self.backup, Command::Backup),
            (self.emergency, Command::Emergency),
            (self.status, Command::Status),
            (self.integrity_check, Command::IntegrityCheck),
            (self.show_config, Command::ShowConfig),
            (self.setup, Command::Setup),
            (self.configure, Command::Configure),
            (self.version, Command::Version),
        ];
        flags
            .into_iter()
            .find(|(set, _)| *set)
            .map(|(_, command)| command)
            .unwrap_or(Command::Help)
    }
}

fn parse_key_size(raw: &str) -> Result<KeySize, String> {
    let bits: u32 = raw
        .parse()
        .map_err(|_| format!("'{}' is not a number", raw))?;
    KeySize::try_from(bits)
}

fn parse_backup_kind(raw: &str) -> Result<BackupKind, String> {
    raw.parse::<BackupKind>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        let mut argv = vec!["ipcertctl"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)
    }

    #[test]
    fn test_issue_request() {
        let cli = parse(&["-i", "203.0.113.10", "-e", "ops@example.com", "-w", "/var/www/html"]).unwrap();
        assert_eq!(
            cli.action(),
            Command::Issue(IssueArgs {
                ip: "203.0.113.10".into(),
                email: Some("ops@example.com".into()),
                webroot: Some("/var/www/html".into()),
                key_size: None,
            })
        );
    }

    #[test]
    fn test_renew_with_jitter() {
        let cli = parse(&["--renew", "--jitter", "300"]).unwrap();
        assert_eq!(
            cli.action(),
            Command::Renew {
                force: false,
                jitter: 300
            }
        );
        let cli = parse(&["--force-renew"]).unwrap();
        assert_eq!(
            cli.action(),
            Command::Renew {
                force: true,
                jitter: 0
            }
        );
    }

    #[test]
    fn test_actions_are_exclusive() {
        assert!(parse(&["--renew", "--list"]).is_err());
        assert!(parse(&["-i", "203.0.113.10", "--status"]).is_err());
    }

    #[test]
    fn test_email_needs_ip() {
        assert!(parse(&["-e", "ops@example.com"]).is_err());
    }

    #[test]
    fn test_restore_optional_name() {
        let cli = parse(&["--restore"]).unwrap();
        assert_eq!(
            cli.action(),
            Command::Restore {
                kind: BackupKind::Config,
                name: None
            }
        );
        let cli = parse(&["--restore", "manual-20261017-101500-000001", "--restore-type", "manual"]).unwrap();
        assert_eq!(
            cli.action(),
            Command::Restore {
                kind: BackupKind::Manual,
                name: Some("manual-20261017-101500-000001".into())
            }
        );
    }

    #[test]
    fn test_key_size_values() {
        let cli = parse(&["-i", "203.0.113.10", "--key-size", "2048"]).unwrap();
        assert_eq!(cli.key_size, Some(KeySize::Rsa2048));
        assert!(parse(&["-i", "203.0.113.10", "--key-size", "1024"]).is_err());
    }

    #[test]
    fn test_no_action_is_help() {
        assert_eq!(parse(&[]).unwrap().action(), Command::Help);
        assert_eq!(parse(&["--debug"]).unwrap().action(), Command::Help);
        assert_eq!(parse(&["-v"]).unwrap().action(), Command::Version);
    }

    #[test]
    fn test_privilege_classes() {
        assert!(!Command::Status.requires_root());
        assert!(!Command::ShowConfig.requires_root());
        assert!(Command::Renew {
            force: false,
            jitter: 0
        }
        .requires_root());
        assert!(Command::Emergency.requires_root());
    }
}
