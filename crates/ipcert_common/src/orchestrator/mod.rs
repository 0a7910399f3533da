//! Certificate Orchestrator - drives one IP certificate request end to end.
//!
//! Idle -> Validating -> CheckingReachability -> PreparingChallenge ->
//! DetectingServer -> Invoking -> InterpretingResult -> Succeeded | Failed
//!
//! Validation is pure and happens before anything else, so invalid input
//! never reaches a probe or a subprocess. The host lock is taken right after
//! validation and held until the run returns.

pub mod certbot;
pub mod challenge;
pub mod server;

use std::fmt;
use std::net::SocketAddr;

use tracing::{info, warn};

use crate::config::Config;
use crate::environment::EnvironmentDescriptor;
use crate::error::{IpcertError, Result};
use crate::exec::CommandRunner;
use crate::lock::{LockOptions, ProcessLock};
use crate::net::{NetworkProbe, TCP_PROBE_TIMEOUT};
use crate::paths::Layout;
use crate::report::RunReport;
use crate::scheduler;
use crate::validation::{validate_email, validate_ip, validate_path, PathPolicy};

use self::certbot::{
    parse_certificates, Authenticator, CertbotClient, CertificateInfo, IssueRequest,
};
use self::challenge::prepare_challenge;
use self::server::select_authenticator;

/// HTTP-01 is always answered on port 80
pub const CHALLENGE_PORT: u16 = 80;

/// Shown after a failed issuance. Issuance is never retried automatically.
pub const TROUBLESHOOTING: &[&str] = &[
    "Confirm the IP address is public and assigned to this host",
    "Confirm port 80 is open in every firewall between the CA and this host",
    "Confirm nothing else is bound to port 80 when using standalone mode",
    "Confirm you control the IP address (no NAT or shared hosting in between)",
    "Read the certbot log at /var/log/letsencrypt/letsencrypt.log",
    "Confirm certbot is 5.0.0 or newer (ipcertctl --status)",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Validating,
    CheckingReachability,
    PreparingChallenge,
    DetectingServer,
    Invoking,
    InterpretingResult,
    Succeeded,
    Failed,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::Validating => "validating",
            OrchestratorState::CheckingReachability => "checking-reachability",
            OrchestratorState::PreparingChallenge => "preparing-challenge",
            OrchestratorState::DetectingServer => "detecting-server",
            OrchestratorState::Invoking => "invoking",
            OrchestratorState::InterpretingResult => "interpreting-result",
            OrchestratorState::Succeeded => "succeeded",
            OrchestratorState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Unvalidated user input
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    pub ip: String,
    pub email: String,
    pub webroot: String,
}

#[derive(Debug, Clone)]
pub struct CertificateOutcome {
    /// Canonical form of the IP the certificate was issued for
    pub ip: String,
    pub authenticator: Authenticator,
    /// Filled from `certbot certificates`; None if the listing failed
    pub certificate: Option<CertificateInfo>,
}

pub struct CertificateOrchestrator<'a> {
    env: &'a EnvironmentDescriptor,
    layout: &'a Layout,
    config: &'a Config,
    runner: &'a dyn CommandRunner,
    net: &'a dyn NetworkProbe,
    lock: LockOptions,
    state: OrchestratorState,
    transitions: Vec<OrchestratorState>,
}

impl<'a> CertificateOrchestrator<'a> {
    pub fn new(
        env: &'a EnvironmentDescriptor,
        layout: &'a Layout,
        config: &'a Config,
        runner: &'a dyn CommandRunner,
        net: &'a dyn NetworkProbe,
    ) -> Self {
        Self {
            env,
            layout,
            config,
            runner,
            net,
            lock: LockOptions::from(&config.lock),
            state: OrchestratorState::Idle,
            transitions: vec![OrchestratorState::Idle],
        }
    }

    pub fn with_lock_options(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Every state visited, in order
    pub fn transitions(&self) -> &[OrchestratorState] {
        &self.transitions
    }

    fn enter(&mut self, state: OrchestratorState) {
        info!("orchestrator: {} -> {}", self.state, state);
        self.state = state;
        self.transitions.push(state);
    }

    /// Run the whole state machine once
    pub fn run(&mut self, raw: &RawRequest, report: &mut RunReport) -> Result<CertificateOutcome> {
        match self.drive(raw, report) {
            Ok(outcome) => {
                self.enter(OrchestratorState::Succeeded);
                info!(
                    target: "audit",
                    "certificate issued for {} via {}",
                    outcome.ip,
                    outcome.authenticator.describe()
                );
                report.suggest(
                    "Short-lived certificates expire in about 6 days: run `ipcertctl --setup-renewal` now",
                );
                Ok(outcome)
            }
            Err(e) => {
                let failed_in = self.state;
                self.enter(OrchestratorState::Failed);
                warn!(target: "audit", "certificate request failed in {}: {}", failed_in, e);
                Err(e)
            }
        }
    }

    fn drive(&mut self, raw: &RawRequest, report: &mut RunReport) -> Result<CertificateOutcome> {
        self.enter(OrchestratorState::Validating);
        let ip = validate_ip(&raw.ip)?;
        let email = validate_email(&raw.email)?;
        let webroot = validate_path(&raw.webroot, PathPolicy::SystemAbsolute)?;
        let canonical = ip.canonical();
        info!("Validated request for {} ({})", canonical, ip.version());

        let _lock = ProcessLock::acquire(&self.layout.lock_file(), "issue", self.lock, self.runner)?;

        self.enter(OrchestratorState::CheckingReachability);
        if self.net.ping(ip.addr()) {
            info!("{} answers ping", canonical);
        } else {
            // Many hosts drop ICMP; only port 80 matters
            warn!("{} does not answer ping", canonical);
        }
        let target = SocketAddr::new(ip.addr(), CHALLENGE_PORT);
        if !self.net.tcp_connect(target, TCP_PROBE_TIMEOUT) {
            report.error(format!("Port {} on {} is unreachable", CHALLENGE_PORT, canonical));
            return Err(IpcertError::PortUnreachable {
                ip: canonical,
                port: CHALLENGE_PORT,
            });
        }

        self.enter(OrchestratorState::PreparingChallenge);
        prepare_challenge(&webroot, self.runner)?;

        self.enter(OrchestratorState::DetectingServer);
        let authenticator = select_authenticator(
            self.config.certificate.web_server,
            &webroot,
            self.env,
            self.runner,
            report,
        );

        self.enter(OrchestratorState::Invoking);
        let hook = scheduler::deploy_hook(self.env, &self.config.renewal);
        let request = IssueRequest {
            ip: &ip,
            email: &email,
            key_size: self.config.certificate.key_size,
            authenticator: &authenticator,
            deploy_hook: Some(&hook),
        };
        let client = CertbotClient::locate(self.layout, self.runner);
        let output = client
            .issue(&request)
            .map_err(|e| IpcertError::ExternalClientFailure(e.to_string()))?;

        self.enter(OrchestratorState::InterpretingResult);
        if !output.success() {
            let detail = output.summary();
            report.error(format!("certbot failed for {}: {}", canonical, detail));
            for item in TROUBLESHOOTING {
                report.suggest(*item);
            }
            return Err(IpcertError::ExternalClientFailure(detail));
        }

        let certificate = match client.certificates(Some(&canonical)) {
            Ok(listing) if listing.success() => parse_certificates(&listing.stdout)
                .into_iter()
                .find(|c| c.name == canonical || c.identifiers.iter().any(|i| i == &canonical)),
            Ok(listing) => {
                report.warn(format!(
                    "Certificate issued but listing failed: {}",
                    listing.summary()
                ));
                None
            }
            Err(e) => {
                report.warn(format!("Certificate issued but listing failed: {}", e));
                None
            }
        };

        Ok(CertificateOutcome {
            ip: canonical,
            authenticator,
            certificate,
        })
    }
}
