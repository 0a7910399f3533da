//! Command handlers
//!
//! Each handler runs synchronously on the blocking thread main() gives it.
//! Mutating handlers pass the privilege gate first; read-only ones never
//! take the host lock.

use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context as _, Result};
use ipcert_common::backup::{BackupKind, BackupManager};
use ipcert_common::config::{Config, ConfigStore};
use ipcert_common::dependencies::DependencyResolver;
use ipcert_common::environment::{EnvironmentDescriptor, EnvironmentProfiler};
use ipcert_common::error::IpcertError;
use ipcert_common::exec::SystemRunner;
use ipcert_common::lock::{LockOptions, ProcessLock};
use ipcert_common::net::SystemNetwork;
use ipcert_common::orchestrator::certbot::{parse_certificates, CertbotClient, REQUIRED_PROFILE};
use ipcert_common::orchestrator::{CertificateOrchestrator, RawRequest};
use ipcert_common::paths::{self, Layout};
use ipcert_common::profiles::{fetch_profiles, has_required_profile};
use ipcert_common::recovery::{integrity_check, RecoveryManager};
use ipcert_common::report::RunReport;
use ipcert_common::scheduler::renewal::{run_renewal, RenewalRequest};
use ipcert_common::scheduler::{self, SchedulerInstaller};
use ipcert_common::validation::{validate_ip, ValidationError};
use rand::Rng;
use tracing::{info, warn};

use crate::cli::{Command, IssueArgs};
use crate::output::{
    display_field, display_info, display_report, display_section, display_success,
    display_warning,
};
use crate::wizard;

/// Version embedded at build time
pub const VERSION: &str = env!("IPCERT_VERSION");

/// Everything a handler needs from the host
pub struct Context {
    pub layout: Layout,
    pub store: ConfigStore,
    /// ipcertctl binary the renewal jobs will call
    pub exe: PathBuf,
    pub runner: SystemRunner,
    pub net: SystemNetwork,
}

impl Context {
    pub fn new(layout: Layout, config_path: Option<PathBuf>, exe: PathBuf) -> Self {
        let path = config_path.unwrap_or_else(|| layout.config_file());
        Self {
            store: ConfigStore::new(path),
            layout,
            exe,
            runner: SystemRunner::new(),
            net: SystemNetwork::new(),
        }
    }

    pub fn config(&self) -> Result<Config> {
        Ok(self.store.load()?)
    }

    pub fn backups(&self, config: &Config) -> BackupManager {
        BackupManager::new(self.layout.backup_dir(), config.backup.max_backups)
    }

    pub fn environment(&self) -> Result<EnvironmentDescriptor> {
        Ok(EnvironmentProfiler::new(&self.layout, &self.runner).profile()?)
    }
}

/// Fail with `InsufficientPrivilege` unless running as root
fn require_root(command: &Command) -> Result<()> {
    if command.requires_root() && !paths::is_root() {
        return Err(IpcertError::InsufficientPrivilege.into());
    }
    Ok(())
}

pub fn run(command: &Command, ctx: &Context) -> Result<()> {
    // Bad input is reported as such even for unprivileged callers
    if let Command::Issue(args) = command {
        validate_ip(&args.ip).map_err(IpcertError::from)?;
    }
    require_root(command)?;

    match command {
        Command::Issue(args) => issue(ctx, args),
        Command::Install => install(ctx),
        Command::Renew { force, jitter } => renew(ctx, *force, *jitter),
        Command::SetupRenewal => setup_renewal(ctx),
        Command::List => list(ctx),
        Command::CheckProfiles => check_profiles(ctx),
        Command::Backup => backup(ctx),
        Command::Restore { kind, name } => restore(ctx, *kind, name.as_deref()),
        Command::Emergency => emergency(ctx),
        Command::Status => status(ctx),
        Command::IntegrityCheck => integrity(ctx),
        Command::ShowConfig => show_config(ctx),
        Command::Setup => wizard::setup(ctx),
        Command::Configure => wizard::configure(ctx),
        Command::Version => {
            println!("ipcertctl {}", VERSION);
            Ok(())
        }
        // Rendered by main, which owns the clap command
        Command::Help => Ok(()),
    }
}

// ============================================================================
// Certificates
// ============================================================================

/// Request a certificate; the config supplies anything the flags left out
pub fn issue(ctx: &Context, args: &IssueArgs) -> Result<()> {
    let mut config = ctx.config()?;
    if let Some(size) = args.key_size {
        config.certificate.key_size = size;
    }
    let raw = RawRequest {
        ip: args.ip.clone(),
        email: args
            .email
            .clone()
            .or_else(|| config.certificate.email.clone())
            .unwrap_or_default(),
        webroot: args
            .webroot
            .clone()
            .unwrap_or_else(|| config.certificate.webroot.clone()),
    };
    issue_with(ctx, &config, &raw)
}

pub(crate) fn issue_with(ctx: &Context, config: &Config, raw: &RawRequest) -> Result<()> {
    let env = ctx.environment()?;
    let mut report = RunReport::new();

    let client = CertbotClient::locate(&ctx.layout, &ctx.runner);
    match client.version() {
        Some(version) if version.is_supported() => info!("Using certbot {}", version),
        found => {
            let detail = found
                .map(|v| format!("certbot {} is too old", v))
                .unwrap_or_else(|| "certbot not found".to_string());
            report.suggest("Run `ipcertctl --install` first");
            display_report(&report);
            return Err(IpcertError::UnresolvedDependencies(vec![detail]).into());
        }
    }

    let mut orchestrator =
        CertificateOrchestrator::new(&env, &ctx.layout, config, &ctx.runner, &ctx.net);
    let result = orchestrator.run(raw, &mut report);
    match &result {
        Ok(outcome) => {
            display_success(&format!("Certificate issued for {}", outcome.ip));
            display_field("Challenge", &outcome.authenticator.describe());
            if let Some(cert) = &outcome.certificate {
                if let Some(expiry) = &cert.expiry {
                    display_field("Expires", expiry);
                }
                if let Some(path) = &cert.certificate_path {
                    display_field("Certificate", path);
                }
                if let Some(path) = &cert.key_path {
                    display_field("Private key", path);
                }
            }
        }
        Err(e) => warn!("Certificate request failed: {}", e),
    }
    display_report(&report);
    Ok(result.map(|_| ())?)
}

pub fn install(ctx: &Context) -> Result<()> {
    let env = ctx.environment()?;
    display_info(&format!(
        "Detected {} ({}, {}, {})",
        env.os_name, env.package_manager, env.init_system, env.architecture
    ));

    let mut report = RunReport::new();
    let resolver = DependencyResolver::new(&env, &ctx.layout, &ctx.runner, &ctx.net);
    let result = resolver
        .ensure_dependencies(&mut report)
        .and_then(|installed| {
            if !installed.is_empty() {
                display_info(&format!("Installed: {}", installed.join(" ")));
            }
            resolver.ensure_certificate_client(&mut report)
        });

    match &result {
        Ok(version) => {
            display_success(&format!("Ready: certbot {}", version));
            report.suggest("Request a certificate with `ipcertctl -i <IP> -e <EMAIL> -w <WEBROOT>`");
        }
        Err(e) => warn!("Installation incomplete: {}", e),
    }
    display_report(&report);
    Ok(result.map(|_| ())?)
}

// ============================================================================
// Renewal
// ============================================================================

pub fn renew(ctx: &Context, force: bool, jitter: u64) -> Result<()> {
    let config = ctx.config()?;
    if !force && !config.renewal.enabled {
        display_info("Renewal is disabled in the configuration; nothing to do");
        return Ok(());
    }

    if jitter > 0 {
        let delay = rand::thread_rng().gen_range(0..=jitter);
        info!(target: "renewal", "sleeping {}s before renewal", delay);
        thread::sleep(Duration::from_secs(delay));
    }

    let env = ctx.environment()?;
    let hook = scheduler::deploy_hook(&env, &config.renewal);
    let backups = ctx.backups(&config);
    let request = RenewalRequest {
        deploy_hook: &hook,
        force,
        lock: LockOptions::from(&config.lock),
        backups: Some(&backups),
    };
    let mut report = RunReport::new();
    let outcome = run_renewal(&ctx.layout, &ctx.runner, &request, &mut report);
    display_report(&report);
    let outcome = outcome?;
    display_success(&format!("Renewal finished: {}", outcome));
    Ok(())
}

pub fn setup_renewal(ctx: &Context) -> Result<()> {
    let config = ctx.config()?;
    let env = ctx.environment()?;
    let mut report = RunReport::new();
    if !config.renewal.enabled {
        report.warn("renewal.enabled is false; scheduled runs will exit without renewing");
    }

    let installer = SchedulerInstaller::new(&env, &ctx.layout, &ctx.runner, ctx.exe.clone())
        .with_lock_options(LockOptions::from(&config.lock));
    let spec = installer.job_spec(&config.renewal);
    let result = installer.install(&spec, &mut report);
    if let Ok(jobs) = &result {
        display_success(&format!("Renewal scheduled {}", spec.interval));
        display_field(
            "Primary",
            &jobs.primary.map(|m| m.to_string()).unwrap_or_else(|| "none".into()),
        );
        display_field(
            "Fallback",
            &jobs.fallback.map(|m| m.to_string()).unwrap_or_else(|| "none".into()),
        );
        display_field("Deploy hook", &spec.deploy_hook);
        display_field(
            "Smoke test",
            if jobs.smoke_test_passed { "passed" } else { "failed" },
        );
    }
    display_report(&report);
    Ok(result.map(|_| ())?)
}

// ============================================================================
// Queries
// ============================================================================

pub fn list(ctx: &Context) -> Result<()> {
    let client = CertbotClient::locate(&ctx.layout, &ctx.runner);
    let output = client
        .certificates(None)
        .with_context(|| format!("could not run {}", client.program()))?;
    if !output.success() {
        return Err(IpcertError::ExternalClientFailure(output.summary()).into());
    }

    let certs = parse_certificates(&output.stdout);
    if certs.is_empty() {
        display_info("No certificates found");
        return Ok(());
    }
    for cert in certs {
        display_section(&cert.name);
        display_field("Identifiers", &cert.identifiers.join(" "));
        display_field("Expires", cert.expiry.as_deref().unwrap_or("unknown"));
        display_field("Certificate", cert.certificate_path.as_deref().unwrap_or("-"));
    }
    Ok(())
}

pub fn check_profiles(ctx: &Context) -> Result<()> {
    let profiles = fetch_profiles(&ctx.net)?;
    display_section("ACME PROFILES");
    for profile in &profiles {
        display_field(&profile.name, &profile.description);
    }
    if !has_required_profile(&profiles) {
        display_warning(&format!(
            "The CA does not advertise the '{}' profile; IP certificates will fail",
            REQUIRED_PROFILE
        ));
    }
    Ok(())
}

pub fn status(ctx: &Context) -> Result<()> {
    println!("ipcertctl {}", VERSION);

    display_section("ENVIRONMENT");
    let env = match ctx.environment() {
        Ok(env) => {
            display_field("OS", &format!("{} ({})", env.os_name, env.os_family));
            display_field("Package manager", &env.package_manager.to_string());
            display_field("Init system", &env.init_system.to_string());
            display_field("Architecture", &env.architecture);
            Some(env)
        }
        Err(e) => {
            display_field("OS", &format!("unknown ({})", e));
            None
        }
    };

    display_section("CERTBOT");
    let client = CertbotClient::locate(&ctx.layout, &ctx.runner);
    match client.version() {
        Some(v) if v.is_supported() => display_field("Version", &v.to_string()),
        Some(v) => display_field("Version", &format!("{} (too old)", v)),
        None => display_field("Version", "not installed"),
    }

    display_section("CONFIGURATION");
    display_field("File", &ctx.store.path().display().to_string());
    let config = match ctx.config() {
        Ok(config) => {
            display_field(
                "Email",
                config.certificate.email.as_deref().unwrap_or("(not set)"),
            );
            display_field("Webroot", &config.certificate.webroot);
            display_field("Key size", &config.certificate.key_size.bits().to_string());
            display_field("Web server", config.certificate.web_server.as_str());
            display_field(
                "Renewal",
                if config.renewal.enabled { "enabled" } else { "disabled" },
            );
            config
        }
        Err(e) => {
            display_field("Status", &format!("unreadable: {}", e));
            Config::default()
        }
    };

    display_section("RENEWAL");
    if let Some(env) = &env {
        let installer = SchedulerInstaller::new(env, &ctx.layout, &ctx.runner, ctx.exe.clone());
        let mechanisms = installer.installed_mechanisms();
        if mechanisms.is_empty() {
            display_field("Jobs", "none (run --setup-renewal)");
        } else {
            let names: Vec<String> = mechanisms.iter().map(|m| m.to_string()).collect();
            display_field("Jobs", &names.join(", "));
        }
    }
    match ProcessLock::holder(&ctx.layout.lock_file()) {
        Some(holder) => display_field(
            "Lock",
            &format!(
                "held by pid {} ({}) since {}",
                holder.pid, holder.operation, holder.acquired_at
            ),
        ),
        None => display_field("Lock", "free"),
    }

    display_section("BACKUPS");
    let backups = ctx.backups(&config);
    for kind in BackupKind::ALL {
        let latest = backups
            .latest(kind)
            .ok()
            .flatten()
            .map(|r| r.taken_at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "none".to_string());
        display_field(kind.as_str(), &latest);
    }
    Ok(())
}

pub fn integrity(ctx: &Context) -> Result<()> {
    let report = integrity_check(&ctx.layout, &ctx.store, &ctx.runner);
    if report.is_healthy() {
        display_success(&format!("All {} checks passed", report.checks_run));
        return Ok(());
    }
    display_section("INTEGRITY");
    for issue in &report.issues {
        display_warning(issue);
    }
    anyhow::bail!(
        "{} of {} checks found issues",
        report.issue_count(),
        report.checks_run
    )
}

pub fn show_config(ctx: &Context) -> Result<()> {
    let config = ctx.config()?;
    println!("# {}", ctx.store.path().display());
    print!("{}", config.to_toml_string()?);
    Ok(())
}

// ============================================================================
// Backup and recovery
// ============================================================================

pub fn backup(ctx: &Context) -> Result<()> {
    let config = ctx.config()?;
    let backups = ctx.backups(&config);
    let mut taken = 0;

    if ctx.store.exists() {
        let record = backups.backup(ctx.store.path(), BackupKind::Manual)?;
        display_field("Configuration", &record.name);
        taken += 1;
    }
    let certificates = ctx.layout.certbot_config_dir();
    if certificates.is_dir() {
        let record = backups.backup(&certificates, BackupKind::Certificate)?;
        display_field("Certificates", &record.name);
        taken += 1;
    }

    if taken == 0 {
        display_info("Nothing to back up yet");
    } else {
        display_success(&format!("{} backup(s) written to {}", taken, backups.root().display()));
    }
    Ok(())
}

pub fn restore(ctx: &Context, kind: BackupKind, name: Option<&str>) -> Result<()> {
    if !matches!(kind, BackupKind::Config | BackupKind::Manual) {
        // Certificate and emergency snapshots are kept for reference only
        return Err(IpcertError::InvalidInput(ValidationError::Forbidden(
            "restore type",
            format!("{} snapshots are restored by hand from the backup directory", kind),
        ))
        .into());
    }

    // Max count is irrelevant for restore; avoid parsing a possibly corrupt config
    let backups = BackupManager::new(ctx.layout.backup_dir(), usize::MAX);
    let record = backups.restore(kind, name, ctx.store.path())?;
    display_success(&format!("Restored {} from {}", ctx.store.path().display(), record.name));

    if let Err(e) = ctx.store.load() {
        display_warning(&format!("The restored configuration does not load: {}", e));
    }
    Ok(())
}

pub fn emergency(ctx: &Context) -> Result<()> {
    let max_backups = ctx
        .config()
        .map(|c| c.backup.max_backups)
        .unwrap_or_else(|_| Config::default().backup.max_backups);
    let backups = BackupManager::new(ctx.layout.backup_dir(), max_backups);
    let env = ctx.environment()?;
    let mut report = RunReport::new();

    let manager = RecoveryManager::new(&env, &ctx.layout, &ctx.store, &backups, &ctx.runner);
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();
    manager.run(&mut input, &mut output, &mut report)?;
    display_report(&report);
    Ok(())
}
