//! Renewal Scheduler Installer
//!
//! Installs two independent ways of running `ipcertctl --renew` every four
//! hours: a primary mechanism chosen by the init system, plus a cron job that
//! is always written. Re-running overwrites both definitions in place, so the
//! host never ends up with duplicate jobs.

pub mod renewal;
pub mod units;

use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::RenewalConfig;
use crate::environment::{EnvironmentDescriptor, InitSystem};
use crate::error::{IpcertError, Result};
use crate::exec::{run_lenient, CommandRunner};
use crate::lock::{LockOptions, ProcessLock};
use crate::orchestrator::certbot::CertbotClient;
use crate::paths::Layout;
use crate::report::RunReport;
use crate::validation::{validate_path, PathPolicy, ValidationError};

use units::{BSD_RC_NAME, CRON_MARKER, LAUNCHD_LABEL};

pub const JOB_NAME: &str = "ipcert-renew";
pub const RENEW_INTERVAL_SECS: u64 = 4 * 60 * 60;
pub const JITTER_SECS: u64 = 300;
pub const INTERVAL_DESCRIPTION: &str = "every 4 hours";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    SystemdTimer,
    OpenRcService,
    SysVService,
    BsdRcService,
    LaunchdDaemon,
    CronD,
    UserCrontab,
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mechanism::SystemdTimer => "systemd timer",
            Mechanism::OpenRcService => "OpenRC service",
            Mechanism::SysVService => "SysV init script",
            Mechanism::BsdRcService => "rc.d service",
            Mechanism::LaunchdDaemon => "launchd daemon",
            Mechanism::CronD => "cron.d entry",
            Mechanism::UserCrontab => "root crontab entry",
        };
        f.write_str(name)
    }
}

/// Primary mechanism for an init system
pub fn primary_mechanism(init: InitSystem) -> Option<Mechanism> {
    match init {
        InitSystem::Systemd => Some(Mechanism::SystemdTimer),
        InitSystem::OpenRc => Some(Mechanism::OpenRcService),
        InitSystem::SysV => Some(Mechanism::SysVService),
        InitSystem::BsdRc => Some(Mechanism::BsdRcService),
        InitSystem::Launchd => Some(Mechanism::LaunchdDaemon),
        InitSystem::Unknown => None,
    }
}

/// What `--setup-renewal` installs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalJobSpec {
    pub interval: &'static str,
    pub command: String,
    pub deploy_hook: String,
    pub primary: Option<Mechanism>,
}

/// Result of an installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledJobs {
    pub primary: Option<Mechanism>,
    pub fallback: Option<Mechanism>,
    pub files: Vec<PathBuf>,
    pub smoke_test_passed: bool,
}

/// Web server reload chain for the init system; never fails.
///
/// A configured hook wins over the built-in chain.
pub fn deploy_hook(env: &EnvironmentDescriptor, renewal: &RenewalConfig) -> String {
    if let Some(custom) = renewal.deploy_hook.as_deref().filter(|h| !h.trim().is_empty()) {
        return custom.to_string();
    }
    let reload = |svc: &str| -> String {
        match env.init_system {
            InitSystem::Systemd => format!("systemctl reload {}", svc),
            InitSystem::OpenRc => format!("rc-service {} reload", svc),
            InitSystem::SysV | InitSystem::BsdRc => format!("service {} reload", svc),
            InitSystem::Launchd => format!("launchctl kickstart -k system/{}", svc),
            InitSystem::Unknown => format!("{} -s reload", svc),
        }
    };
    let mut chain: Vec<String> = ["nginx", "apache2", "httpd"]
        .iter()
        .map(|svc| format!("{} 2>/dev/null", reload(svc)))
        .collect();
    chain.push("true".to_string());
    chain.join(" || ")
}

/// The job templates embed the binary path inside nested shell quotes, so
/// only plain absolute paths are accepted
pub fn check_exe_path(exe: &Path) -> Result<()> {
    let raw = exe.to_str().ok_or_else(|| {
        ValidationError::Forbidden("executable path", "path is not valid UTF-8".to_string())
    })?;
    validate_path(raw, PathPolicy::SystemAbsolute)?;
    if let Some(bad) = raw
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || "/._+-".contains(*c)))
    {
        return Err(ValidationError::Forbidden(
            "executable path",
            format!("{:?} cannot be embedded in a job definition", bad),
        )
        .into());
    }
    Ok(())
}

/// Command line every mechanism runs
pub fn renew_command(exe: &Path) -> String {
    format!("{} --renew --jitter {}", exe.display(), JITTER_SECS)
}

pub struct SchedulerInstaller<'a> {
    env: &'a EnvironmentDescriptor,
    layout: &'a Layout,
    runner: &'a dyn CommandRunner,
    exe: PathBuf,
    lock: LockOptions,
}

impl<'a> SchedulerInstaller<'a> {
    /// `exe` is the ipcertctl binary the jobs will call
    pub fn new(
        env: &'a EnvironmentDescriptor,
        layout: &'a Layout,
        runner: &'a dyn CommandRunner,
        exe: impl Into<PathBuf>,
    ) -> Self {
        Self {
            env,
            layout,
            runner,
            exe: exe.into(),
            lock: LockOptions::default(),
        }
    }

    pub fn with_lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn job_spec(&self, renewal: &RenewalConfig) -> RenewalJobSpec {
        RenewalJobSpec {
            interval: INTERVAL_DESCRIPTION,
            command: renew_command(&self.exe),
            deploy_hook: deploy_hook(self.env, renewal),
            primary: primary_mechanism(self.env.init_system),
        }
    }

    /// Install primary and fallback jobs, then run one renewal dry-run.
    ///
    /// Holds the host lock throughout so the dry-run never overlaps a
    /// scheduled renewal or an issuance.
    pub fn install(&self, spec: &RenewalJobSpec, report: &mut RunReport) -> Result<InstalledJobs> {
        check_exe_path(&self.exe)?;
        let _lock = ProcessLock::acquire(
            &self.layout.lock_file(),
            "setup-renewal",
            self.lock,
            self.runner,
        )?;
        let mut files = Vec::new();

        let primary = match spec.primary {
            Some(mechanism) => match self.install_primary(mechanism, &spec.command, &mut files) {
                Ok(()) => {
                    info!(target: "audit", "installed {} for renewal", mechanism);
                    Some(mechanism)
                }
                Err(e) => {
                    report.warn(format!("{} could not be installed: {}", mechanism, e));
                    None
                }
            },
            None => {
                report.warn(format!(
                    "No supported init system detected ({}); relying on cron only",
                    self.env.init_system
                ));
                None
            }
        };

        let fallback = match self.install_cron(&spec.command, &mut files) {
            Ok(mechanism) => {
                info!(target: "audit", "installed {} for renewal", mechanism);
                Some(mechanism)
            }
            Err(e) if primary.is_some() => {
                report.warn(format!("cron fallback could not be installed: {}", e));
                report.suggest(format!(
                    "Add this line to root's crontab by hand: {}",
                    units::cron_line(&spec.command, None)
                ));
                None
            }
            Err(e) => {
                return Err(IpcertError::SchedulerUnavailable(format!(
                    "no primary mechanism and cron failed: {}",
                    e
                )))
            }
        };

        let smoke_test_passed = self.smoke_test(report);
        info!(
            target: "renewal",
            "renewal scheduled {} (primary: {}, fallback: {})",
            spec.interval,
            primary.map(|m| m.to_string()).unwrap_or_else(|| "none".into()),
            fallback.map(|m| m.to_string()).unwrap_or_else(|| "none".into())
        );

        Ok(InstalledJobs {
            primary,
            fallback,
            files,
            smoke_test_passed,
        })
    }

    fn install_primary(
        &self,
        mechanism: Mechanism,
        command: &str,
        files: &mut Vec<PathBuf>,
    ) -> Result<()> {
        match mechanism {
            Mechanism::SystemdTimer => {
                let dir = self.layout.systemd_unit_dir();
                let service = dir.join(format!("{}.service", JOB_NAME));
                let timer = dir.join(format!("{}.timer", JOB_NAME));
                write_file(&service, &units::systemd_service(command), 0o644)?;
                write_file(&timer, &units::systemd_timer(), 0o644)?;
                files.extend([service, timer]);
                self.require("systemctl", &["daemon-reload"])?;
                self.require("systemctl", &["enable", "--now", &format!("{}.timer", JOB_NAME)])
            }
            Mechanism::OpenRcService => {
                let script = self.layout.init_d_dir().join(JOB_NAME);
                write_file(&script, &units::openrc_script(command), 0o755)?;
                files.push(script);
                self.require("rc-update", &["add", JOB_NAME, "default"])?;
                self.require("rc-service", &[JOB_NAME, "restart"])
            }
            Mechanism::SysVService => {
                let script = self.layout.init_d_dir().join(JOB_NAME);
                write_file(&script, &units::sysv_script(command), 0o755)?;
                files.push(script);
                if self.runner.exists("update-rc.d") {
                    self.require("update-rc.d", &[JOB_NAME, "defaults"])?;
                } else {
                    self.require("chkconfig", &["--add", JOB_NAME])?;
                }
                self.require("service", &[JOB_NAME, "restart"])
            }
            Mechanism::BsdRcService => {
                let script = self.layout.bsd_rc_dir().join(BSD_RC_NAME);
                write_file(&script, &units::bsd_rc_script(command), 0o755)?;
                files.push(script);
                self.require("sysrc", &[&format!("{}_enable=YES", BSD_RC_NAME)])?;
                self.require("service", &[BSD_RC_NAME, "restart"])
            }
            Mechanism::LaunchdDaemon => {
                let plist = self.launchd_plist_path();
                let jitter = JITTER_SECS.to_string();
                let args = ["--renew", "--jitter", jitter.as_str()];
                let exe = self.exe.to_string_lossy();
                write_file(&plist, &units::launchd_plist(&exe, &args), 0o644)?;
                let plist_str = plist.to_string_lossy().to_string();
                files.push(plist);
                // Unload first so a changed definition is picked up
                run_lenient(self.runner, "launchctl", &["unload", &plist_str]);
                self.require("launchctl", &["load", "-w", &plist_str])
            }
            Mechanism::CronD | Mechanism::UserCrontab => Ok(()),
        }
    }

    fn install_cron(&self, command: &str, files: &mut Vec<PathBuf>) -> Result<Mechanism> {
        let cron_d = self.layout.cron_d_dir();
        if cron_d.is_dir() {
            let entry = cron_d.join(JOB_NAME);
            write_file(&entry, &units::cron_d_entry(command), 0o644)?;
            files.push(entry);
            return Ok(Mechanism::CronD);
        }

        if !self.runner.exists("crontab") {
            return Err(IpcertError::SchedulerUnavailable(
                "neither /etc/cron.d nor crontab is available".into(),
            ));
        }
        // `crontab -l` fails when there is no crontab yet
        let current = run_lenient(self.runner, "crontab", &["-l"]);
        let existing = if current.success() {
            current.stdout
        } else {
            String::new()
        };
        let merged = units::merge_crontab(&existing, command);
        let out = self
            .runner
            .run_with_input("crontab", &["-"], &merged)
            .map_err(|e| IpcertError::SchedulerUnavailable(format!("crontab: {}", e)))?;
        if !out.success() {
            return Err(IpcertError::SchedulerUnavailable(format!(
                "crontab - failed ({})",
                out.status_text()
            )));
        }
        Ok(Mechanism::UserCrontab)
    }

    fn smoke_test(&self, report: &mut RunReport) -> bool {
        let client = CertbotClient::locate(self.layout, self.runner);
        match client.renew(true, false, None) {
            Ok(out) if out.success() => {
                info!(target: "renewal", "post-install renewal dry-run passed");
                true
            }
            Ok(out) => {
                report.warn(format!(
                    "Renewal dry-run after installation failed ({})",
                    out.status_text()
                ));
                report.suggest("Run `certbot renew --dry-run` to see why renewal would fail");
                false
            }
            Err(e) => {
                report.warn(format!("Could not run renewal dry-run: {}", e));
                false
            }
        }
    }

    /// Run a supervisor command that must succeed
    fn require(&self, program: &str, args: &[&str]) -> Result<()> {
        let out = run_lenient(self.runner, program, args);
        if out.success() {
            Ok(())
        } else {
            Err(IpcertError::SchedulerUnavailable(format!(
                "{} {} failed ({})",
                program,
                args.join(" "),
                out.status_text()
            )))
        }
    }

    fn launchd_plist_path(&self) -> PathBuf {
        self.layout
            .launchd_dir()
            .join(format!("{}.plist", LAUNCHD_LABEL))
    }

    /// Mechanisms whose definitions are present on disk
    pub fn installed_mechanisms(&self) -> Vec<Mechanism> {
        let mut found = Vec::new();
        let unit_dir = self.layout.systemd_unit_dir();
        if unit_dir.join(format!("{}.timer", JOB_NAME)).exists() {
            found.push(Mechanism::SystemdTimer);
        }
        let init_script = self.layout.init_d_dir().join(JOB_NAME);
        if init_script.exists() {
            let is_openrc = fs::read_to_string(&init_script)
                .map(|s| s.starts_with("#!/sbin/openrc-run"))
                .unwrap_or(false);
            found.push(if is_openrc {
                Mechanism::OpenRcService
            } else {
                Mechanism::SysVService
            });
        }
        if self.layout.bsd_rc_dir().join(BSD_RC_NAME).exists() {
            found.push(Mechanism::BsdRcService);
        }
        if self.launchd_plist_path().exists() {
            found.push(Mechanism::LaunchdDaemon);
        }
        if self.layout.cron_d_dir().join(JOB_NAME).exists() {
            found.push(Mechanism::CronD);
        } else if self.runner.exists("crontab") {
            let out = run_lenient(self.runner, "crontab", &["-l"]);
            if out.success() && out.stdout.contains(CRON_MARKER) {
                found.push(Mechanism::UserCrontab);
            }
        }
        found
    }

    /// Stop running renewal jobs; every step is best-effort
    pub fn stop_jobs(&self) {
        let attempts: Vec<(&str, Vec<String>)> = match self.env.init_system {
            InitSystem::Systemd => vec![(
                "systemctl",
                vec![
                    "stop".into(),
                    format!("{}.timer", JOB_NAME),
                    format!("{}.service", JOB_NAME),
                ],
            )],
            InitSystem::OpenRc => vec![("rc-service", vec![JOB_NAME.into(), "stop".into()])],
            InitSystem::SysV => vec![("service", vec![JOB_NAME.into(), "stop".into()])],
            InitSystem::BsdRc => vec![("service", vec![BSD_RC_NAME.into(), "onestop".into()])],
            InitSystem::Launchd => vec![(
                "launchctl",
                vec![
                    "unload".into(),
                    self.launchd_plist_path().to_string_lossy().to_string(),
                ],
            )],
            InitSystem::Unknown => Vec::new(),
        };

        for (program, args) in attempts {
            let refs: Vec<&str> = args.iter().map(String::as_str).collect();
            let out = run_lenient(self.runner, program, &refs);
            if !out.success() {
                warn!("{} {} did not succeed (ignored)", program, refs.join(" "));
            }
        }
        // Renewals started by cron or a loop script
        run_lenient(self.runner, "pkill", &["-f", "--", "--renew --jitter"]);
    }
}

fn write_file(path: &Path, content: &str, mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| IpcertError::io(parent, e))?;
    }
    fs::write(path, content).map_err(|e| IpcertError::io(path, e))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| IpcertError::io(path, e))
}
