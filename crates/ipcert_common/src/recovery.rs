//! Recovery procedure and integrity check.
//!
//! Recovery is the only interactive path in the library: it stops running
//! renewal jobs, takes an emergency snapshot, then lets the operator pick
//! what to do from a fixed menu.

use std::fs;
use std::io::{BufRead, Write};
use std::path::Path;

use nix::unistd::{access, AccessFlags};
use tracing::{info, warn};

use crate::backup::{BackupKind, BackupManager, BackupRecord};
use crate::config::{Config, ConfigStore};
use crate::environment::EnvironmentDescriptor;
use crate::error::{IpcertError, Result};
use crate::exec::CommandRunner;
use crate::orchestrator::certbot::CertbotClient;
use crate::paths::Layout;
use crate::report::RunReport;
use crate::scheduler::SchedulerInstaller;

// ============================================================================
// Integrity check
// ============================================================================

/// Result of the read-only integrity check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub checks_run: usize,
    pub issues: Vec<String>,
}

impl IntegrityReport {
    pub fn issue_count(&self) -> usize {
        self.issues.len()
    }

    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }

    fn check(&mut self, result: std::result::Result<(), String>) {
        self.checks_run += 1;
        if let Err(issue) = result {
            self.issues.push(issue);
        }
    }
}

fn check_config(store: &ConfigStore) -> std::result::Result<(), String> {
    if !store.exists() {
        // Defaults apply; nothing to parse
        return Ok(());
    }
    store
        .load()
        .map(|_| ())
        .map_err(|e| format!("{}: {}", store.path().display(), e))
}

fn check_readable_dir(dir: &Path) -> std::result::Result<(), String> {
    fs::read_dir(dir)
        .map(|_| ())
        .map_err(|e| format!("certificate directory {} is not readable: {}", dir.display(), e))
}

fn check_writable_dir(dir: &Path) -> std::result::Result<(), String> {
    if !dir.is_dir() {
        return Err(format!("log directory {} does not exist", dir.display()));
    }
    access(dir, AccessFlags::W_OK)
        .map_err(|e| format!("log directory {} is not writable: {}", dir.display(), e))
}

/// Read-only health check. Never modifies anything.
pub fn integrity_check(layout: &Layout, store: &ConfigStore, runner: &dyn CommandRunner) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    report.check(check_config(store));
    report.check(check_readable_dir(&layout.certbot_config_dir()));
    report.check(check_writable_dir(&layout.log_dir()));

    let client = CertbotClient::locate(layout, runner);
    report.check(if client.is_installed() {
        Ok(())
    } else {
        Err(format!("certbot not found ({})", client.program()))
    });

    info!(
        "Integrity check: {} checks, {} issue(s)",
        report.checks_run,
        report.issue_count()
    );
    report
}

// ============================================================================
// Recovery
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    RestoreConfig,
    ResetDefaults,
    IntegrityCheck,
    Exit,
}

impl MenuChoice {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "1" => Some(MenuChoice::RestoreConfig),
            "2" => Some(MenuChoice::ResetDefaults),
            "3" => Some(MenuChoice::IntegrityCheck),
            "4" | "q" | "exit" => Some(MenuChoice::Exit),
            _ => None,
        }
    }
}

const MENU: &str = "\
Recovery options:
  1) Restore configuration from the latest backup
  2) Reset configuration to defaults
  3) Run integrity check
  4) Exit
";

pub struct RecoveryManager<'a> {
    env: &'a EnvironmentDescriptor,
    layout: &'a Layout,
    store: &'a ConfigStore,
    backups: &'a BackupManager,
    runner: &'a dyn CommandRunner,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(
        env: &'a EnvironmentDescriptor,
        layout: &'a Layout,
        store: &'a ConfigStore,
        backups: &'a BackupManager,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        Self {
            env,
            layout,
            store,
            backups,
            runner,
        }
    }

    /// Stop renewal jobs and snapshot config, certificates and both log trees
    pub fn prepare(&self, report: &mut RunReport) -> Result<BackupRecord> {
        info!(target: "audit", "emergency recovery started");
        SchedulerInstaller::new(self.env, self.layout, self.runner, "ipcertctl").stop_jobs();

        let config_file = self.store.path().to_path_buf();
        let certificates = self.layout.certbot_config_dir();
        let logs = self.layout.log_dir();
        let certbot_logs = self.layout.certbot_log_dir();
        self.backups.snapshot_emergency(
            &[
                ("config.toml", config_file.as_path()),
                ("letsencrypt", certificates.as_path()),
                ("logs", logs.as_path()),
                ("letsencrypt-logs", certbot_logs.as_path()),
            ],
            report,
        )
    }

    pub fn restore_config(&self, name: Option<&str>) -> Result<BackupRecord> {
        self.backups.restore(BackupKind::Config, name, self.store.path())
    }

    /// Overwrite the config with defaults (the current file is backed up first)
    pub fn reset_defaults(&self) -> Result<()> {
        self.store.save(&Config::default(), self.backups)?;
        info!(target: "audit", "configuration reset to defaults");
        Ok(())
    }

    pub fn integrity_check(&self) -> IntegrityReport {
        integrity_check(self.layout, self.store, self.runner)
    }

    /// Full procedure: prepare, then loop over the menu until exit or EOF
    pub fn run(
        &self,
        input: &mut dyn BufRead,
        output: &mut dyn Write,
        report: &mut RunReport,
    ) -> Result<BackupRecord> {
        let snapshot = self.prepare(report)?;
        let io_err = |e| IpcertError::io(self.store.path(), e);
        writeln!(output, "Emergency snapshot saved to {}", snapshot.path.display()).map_err(io_err)?;

        loop {
            write!(output, "\n{}Choice [1-4]: ", MENU).map_err(io_err)?;
            output.flush().map_err(io_err)?;

            let mut line = String::new();
            if input.read_line(&mut line).map_err(io_err)? == 0 {
                break;
            }
            let Some(choice) = MenuChoice::parse(&line) else {
                writeln!(output, "Please enter 1, 2, 3 or 4.").map_err(io_err)?;
                continue;
            };

            match choice {
                MenuChoice::RestoreConfig => match self.restore_config(None) {
                    Ok(record) => {
                        writeln!(output, "Restored configuration from {}", record.name).map_err(io_err)?
                    }
                    Err(e) => {
                        warn!("Config restore failed: {}", e);
                        report.error(e.to_string());
                        writeln!(output, "Restore failed: {}", e).map_err(io_err)?;
                    }
                },
                MenuChoice::ResetDefaults => match self.reset_defaults() {
                    Ok(()) => writeln!(output, "Configuration reset to defaults").map_err(io_err)?,
                    Err(e) => {
                        report.error(e.to_string());
                        writeln!(output, "Reset failed: {}", e).map_err(io_err)?;
                    }
                },
                MenuChoice::IntegrityCheck => {
                    let integrity = self.integrity_check();
                    if integrity.is_healthy() {
                        writeln!(output, "All {} checks passed", integrity.checks_run).map_err(io_err)?;
                    } else {
                        writeln!(output, "{} issue(s) found:", integrity.issue_count()).map_err(io_err)?;
                        for issue in &integrity.issues {
                            writeln!(output, "  - {}", issue).map_err(io_err)?;
                        }
                    }
                }
                MenuChoice::Exit => break,
            }
        }

        report.suggest("Renewal jobs were stopped; run `ipcertctl --setup-renewal` to restart them");
        Ok(snapshot)
    }
}
