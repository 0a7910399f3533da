//! Renewal execution, shared by every scheduled mechanism and `--renew`.
//!
//! A dry-run always goes first. Only when it passes does the real
//! `certbot renew` run, with the deploy hook attached so web servers reload
//! after an actual renewal and never after a "not yet due" no-op. A forced
//! renewal first snapshots the certbot state; that snapshot is best effort.

use std::fmt;

use tracing::{info, warn};

use crate::backup::{BackupKind, BackupManager};
use crate::error::{IpcertError, Result};
use crate::exec::CommandRunner;
use crate::lock::{LockOptions, ProcessLock};
use crate::orchestrator::certbot::CertbotClient;
use crate::paths::Layout;
use crate::report::RunReport;

const NOTHING_DUE_PHRASES: &[&str] = &["No renewals were attempted", "not yet due"];
const RENEWED_PHRASES: &[&str] = &["all renewals succeeded"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// Every certificate is still inside its validity window
    NothingDue,
    Renewed,
    /// certbot succeeded without either recognised phrase
    Completed,
}

impl fmt::Display for RenewalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RenewalOutcome::NothingDue => "no certificates due for renewal",
            RenewalOutcome::Renewed => "all renewals succeeded",
            RenewalOutcome::Completed => "renewal run completed",
        })
    }
}

/// Classify successful certbot output
pub fn classify_output(output: &str) -> RenewalOutcome {
    let lowered = output.to_lowercase();
    if NOTHING_DUE_PHRASES
        .iter()
        .any(|p| lowered.contains(&p.to_lowercase()))
    {
        RenewalOutcome::NothingDue
    } else if RENEWED_PHRASES.iter().any(|p| lowered.contains(p)) {
        RenewalOutcome::Renewed
    } else {
        RenewalOutcome::Completed
    }
}

/// Renewal request
#[derive(Debug, Clone)]
pub struct RenewalRequest<'a> {
    pub deploy_hook: &'a str,
    pub force: bool,
    pub lock: LockOptions,
    /// Where a forced renewal snapshots the certbot state first
    pub backups: Option<&'a BackupManager>,
}

/// Take the host lock, dry-run, then renew for real
pub fn run_renewal(
    layout: &Layout,
    runner: &dyn CommandRunner,
    request: &RenewalRequest<'_>,
    report: &mut RunReport,
) -> Result<RenewalOutcome> {
    let operation = if request.force { "force-renew" } else { "renew" };
    let _lock = ProcessLock::acquire(&layout.lock_file(), operation, request.lock, runner)?;
    let client = CertbotClient::locate(layout, runner);

    info!(target: "renewal", "starting renewal dry-run");
    let dry = client
        .renew(true, false, None)
        .map_err(|e| IpcertError::DryRunFailed(e.to_string()))?;
    if !dry.success() {
        let detail = dry.summary();
        warn!(target: "renewal", "dry-run failed, skipping real renewal: {}", detail);
        return Err(IpcertError::DryRunFailed(detail));
    }

    if let (true, Some(backups)) = (request.force, request.backups) {
        let certificates = layout.certbot_config_dir();
        if certificates.is_dir() {
            backups.backup_best_effort(&certificates, BackupKind::Certificate, report);
        }
    }

    info!(target: "renewal", "dry-run passed, running {}", operation);
    let real = client
        .renew(false, request.force, Some(request.deploy_hook))
        .map_err(|e| IpcertError::ExternalClientFailure(e.to_string()))?;
    if !real.success() {
        let detail = real.summary();
        warn!(target: "renewal", "renewal failed: {}", detail);
        return Err(IpcertError::ExternalClientFailure(detail));
    }

    let outcome = classify_output(&real.combined());
    info!(target: "renewal", "renewal finished: {}", outcome);
    Ok(outcome)
}
