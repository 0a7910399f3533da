//! Dependency Resolver
//!
//! Makes sure the host can run certbot and the checks around it:
//!
//! 1. Pre-flight: temp disk space and memory (warnings), network reachability
//!    of the CA (fatal when it fails).
//! 2. Required tools, each checked with a self-test command rather than a
//!    bare PATH lookup.
//! 3. DNS lookup capability: any one of dig, host or nslookup.
//! 4. Missing packages go through the package manager, retried up to
//!    [`INSTALL_ATTEMPTS`] times with a fixed delay.
//! 5. Re-verify, then re-run the self-tests; anything still missing comes
//!    back as `UnresolvedDependencies` with manual install steps in the
//!    report.
//!
//! The certbot version gate lives in [`DependencyResolver::ensure_certificate_client`].

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::environment::{EnvironmentDescriptor, OsFamily, PackageManager};
use crate::error::{IpcertError, Result};
use crate::exec::{run_lenient, CommandRunner};
use crate::net::NetworkProbe;
use crate::orchestrator::certbot::{CertbotClient, CertbotVersion, MIN_VERSION, STAGING_DIRECTORY};
use crate::paths::Layout;
use crate::report::RunReport;

pub const INSTALL_ATTEMPTS: u32 = 3;
pub const INSTALL_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Host used for the DNS half of the network pre-flight
pub const NETWORK_TEST_HOST: &str = "acme-staging-v02.api.letsencrypt.org";

const MIN_TEMP_SPACE_MB: u64 = 100;
const MIN_MEMORY_MB: u64 = 256;

/// A tool and the command that proves it works
#[derive(Debug, Clone, Copy)]
pub struct ToolCheck {
    pub name: &'static str,
    pub program: &'static str,
    pub self_test: &'static [&'static str],
}

/// HTTP client, TLS toolkit, scripting runtime
pub const REQUIRED_TOOLS: &[ToolCheck] = &[
    ToolCheck {
        name: "curl",
        program: "curl",
        self_test: &["--version"],
    },
    ToolCheck {
        name: "openssl",
        program: "openssl",
        self_test: &["version"],
    },
    ToolCheck {
        name: "python3",
        program: "python3",
        self_test: &["--version"],
    },
];

/// Interchangeable DNS lookup tools
pub const DNS_TOOLS: &[ToolCheck] = &[
    ToolCheck {
        name: "dig",
        program: "dig",
        self_test: &["-v"],
    },
    ToolCheck {
        name: "host",
        program: "host",
        self_test: &["-V"],
    },
    ToolCheck {
        name: "nslookup",
        program: "nslookup",
        self_test: &["-version"],
    },
];

/// Name used for the DNS requirement in reports
pub const DNS_REQUIREMENT: &str = "dns-tools";

pub const CERTBOT_REQUIREMENT: &str = "certbot";

// ============================================================================
// Package tables
// ============================================================================

/// Package providing `requirement` on `family`
pub fn package_for(family: OsFamily, requirement: &str) -> Option<&'static str> {
    use OsFamily::*;
    let package = match (requirement, family) {
        ("curl", _) => "curl",
        ("openssl", _) => "openssl",
        ("python3", Arch) => "python",
        ("python3", Gentoo) => "dev-lang/python",
        ("python3", MacOs) => "python",
        ("python3", _) => "python3",
        (DNS_REQUIREMENT, Debian) => "dnsutils",
        (DNS_REQUIREMENT, Redhat | Suse) => "bind-utils",
        (DNS_REQUIREMENT, Arch | MacOs) => "bind",
        (DNS_REQUIREMENT, Alpine) => "bind-tools",
        (DNS_REQUIREMENT, Gentoo) => "net-dns/bind-tools",
        (DNS_REQUIREMENT, FreeBsd | DragonFly | NetBsd) => "bind-tools",
        (DNS_REQUIREMENT, OpenBsd) => "isc-bind",
        (CERTBOT_REQUIREMENT, Suse) => "python3-certbot",
        (CERTBOT_REQUIREMENT, Gentoo) => "app-crypt/certbot",
        (CERTBOT_REQUIREMENT, FreeBsd | DragonFly | NetBsd) => "py311-certbot",
        (CERTBOT_REQUIREMENT, _) => "certbot",
        _ => return None,
    };
    Some(package)
}

/// Program and leading args that install packages non-interactively
pub fn install_command(manager: PackageManager) -> Option<(&'static str, &'static [&'static str])> {
    let cmd: (&'static str, &'static [&'static str]) = match manager {
        PackageManager::Apt => (
            "env",
            &["DEBIAN_FRONTEND=noninteractive", "apt-get", "install", "-y"][..],
        ),
        PackageManager::Dnf => ("dnf", &["install", "-y"][..]),
        PackageManager::Yum => ("yum", &["install", "-y"][..]),
        PackageManager::Zypper => ("zypper", &["--non-interactive", "install"][..]),
        PackageManager::Pacman => ("pacman", &["-S", "--noconfirm", "--needed"][..]),
        PackageManager::Apk => ("apk", &["add", "--no-cache"][..]),
        PackageManager::Emerge => ("emerge", &["--noreplace"][..]),
        PackageManager::Pkg => ("pkg", &["install", "-y"][..]),
        PackageManager::PkgAdd => ("pkg_add", &["-I"][..]),
        PackageManager::Pkgin => ("pkgin", &["-y", "install"][..]),
        PackageManager::Brew => ("brew", &["install"][..]),
        PackageManager::Unknown => return None,
    };
    Some(cmd)
}

/// Index refresh run once before installing
fn refresh_command(manager: PackageManager) -> Option<(&'static str, &'static [&'static str])> {
    match manager {
        PackageManager::Apt => Some(("apt-get", &["update", "-qq"][..])),
        PackageManager::Apk => Some(("apk", &["update"][..])),
        PackageManager::Pkg => Some(("pkg", &["update"][..])),
        _ => None,
    }
}

/// Operator-facing install instructions for `missing` on this host
pub fn manual_instructions(env: &EnvironmentDescriptor, missing: &[String]) -> String {
    let packages: Vec<&str> = missing
        .iter()
        .filter_map(|req| package_for(env.os_family, req))
        .collect();

    match install_command(env.package_manager) {
        Some((program, args)) if !packages.is_empty() => {
            let mut line = vec![program];
            line.extend_from_slice(args);
            line.extend(packages);
            format!("Install manually ({}): {}", env.os_family, line.join(" "))
        }
        _ => format!(
            "Install manually with your package manager: {} (certbot {} or newer is also \
             available via: python3 -m venv /opt/ipcert/certbot && \
             /opt/ipcert/certbot/bin/pip install certbot)",
            missing.join(", "),
            MIN_VERSION
        ),
    }
}

// ============================================================================
// Resolver
// ============================================================================

pub struct DependencyResolver<'a> {
    env: &'a EnvironmentDescriptor,
    layout: &'a Layout,
    runner: &'a dyn CommandRunner,
    net: &'a dyn NetworkProbe,
    retry_delay: Duration,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(
        env: &'a EnvironmentDescriptor,
        layout: &'a Layout,
        runner: &'a dyn CommandRunner,
        net: &'a dyn NetworkProbe,
    ) -> Self {
        Self {
            env,
            layout,
            runner,
            net,
            retry_delay: INSTALL_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Full resolution pass. Returns the packages that were installed.
    pub fn ensure_dependencies(&self, report: &mut RunReport) -> Result<Vec<String>> {
        self.preflight(report)?;

        let missing = self.missing_requirements();
        if missing.is_empty() {
            info!("All required tools present");
            return Ok(Vec::new());
        }
        info!("Missing requirements: {}", missing.join(", "));

        let packages: Vec<String> = missing
            .iter()
            .filter_map(|req| package_for(self.env.os_family, req))
            .map(str::to_string)
            .collect();

        let installed = if self.install_packages(&packages, report) {
            packages
        } else {
            Vec::new()
        };

        // Presence first, then the functional self-tests again
        let mut unresolved: Vec<String> = missing
            .iter()
            .filter(|req| !self.is_present(req))
            .cloned()
            .collect();
        if unresolved.is_empty() {
            unresolved = self.missing_requirements();
        }

        if !unresolved.is_empty() {
            report.suggest(manual_instructions(self.env, &unresolved));
            return Err(IpcertError::UnresolvedDependencies(unresolved));
        }

        info!(target: "audit", "installed packages: {}", installed.join(" "));
        Ok(installed)
    }

    /// Disk and memory are advisory; the network check is fatal
    pub fn preflight(&self, report: &mut RunReport) -> Result<()> {
        if let Some(mb) = temp_space_mb(&std::env::temp_dir()) {
            if mb < MIN_TEMP_SPACE_MB {
                report.warn(format!(
                    "Only {} MB free in {}; package installs may fail",
                    mb,
                    std::env::temp_dir().display()
                ));
            }
        }

        if let Some(mb) = available_memory_mb(&self.layout.resolve("/proc/meminfo")) {
            if mb < MIN_MEMORY_MB {
                report.warn(format!("Only {} MB memory available; certbot may be slow", mb));
            }
        }

        if !self.net.resolve(NETWORK_TEST_HOST) {
            report.suggest("Check /etc/resolv.conf and outbound DNS (port 53)");
            return Err(IpcertError::NetworkUnreachable(format!(
                "cannot resolve {}",
                NETWORK_TEST_HOST
            )));
        }
        if !self.net.https_reachable(STAGING_DIRECTORY) {
            report.suggest("Check outbound HTTPS (port 443) and any proxy settings");
            return Err(IpcertError::NetworkUnreachable(format!(
                "no HTTPS response from {}",
                STAGING_DIRECTORY
            )));
        }
        debug!("Network pre-flight passed");
        Ok(())
    }

    /// Requirements whose self-test does not pass
    pub fn missing_requirements(&self) -> Vec<String> {
        let mut missing: Vec<String> = REQUIRED_TOOLS
            .iter()
            .filter(|tool| !self.self_test(tool))
            .map(|tool| tool.name.to_string())
            .collect();

        if !DNS_TOOLS.iter().any(|tool| self.self_test(tool)) {
            missing.push(DNS_REQUIREMENT.to_string());
        }
        missing
    }

    fn self_test(&self, tool: &ToolCheck) -> bool {
        if !self.runner.exists(tool.program) {
            return false;
        }
        let ok = run_lenient(self.runner, tool.program, tool.self_test).success();
        if !ok {
            warn!("{} is installed but its self-test failed", tool.name);
        }
        ok
    }

    fn is_present(&self, requirement: &str) -> bool {
        if requirement == DNS_REQUIREMENT {
            return DNS_TOOLS.iter().any(|t| self.runner.exists(t.program));
        }
        REQUIRED_TOOLS
            .iter()
            .find(|t| t.name == requirement)
            .is_some_and(|t| self.runner.exists(t.program))
    }

    /// Install `packages`, retrying the whole command on failure
    pub fn install_packages(&self, packages: &[String], report: &mut RunReport) -> bool {
        if packages.is_empty() {
            return true;
        }
        let Some((program, base_args)) = install_command(self.env.package_manager) else {
            report.warn(format!(
                "No known package manager on {}; cannot install {}",
                self.env.os_name,
                packages.join(" ")
            ));
            return false;
        };

        if let Some((refresh, refresh_args)) = refresh_command(self.env.package_manager) {
            let out = run_lenient(self.runner, refresh, refresh_args);
            if !out.success() {
                warn!("Package index refresh failed ({})", out.status_text());
            }
        }

        let mut args: Vec<&str> = base_args.to_vec();
        args.extend(packages.iter().map(String::as_str));

        for attempt in 1..=INSTALL_ATTEMPTS {
            info!(attempt, "Installing {}", packages.join(" "));
            let out = run_lenient(self.runner, program, &args);
            if out.success() {
                return true;
            }
            warn!(
                "Install attempt {}/{} failed ({})",
                attempt,
                INSTALL_ATTEMPTS,
                out.status_text()
            );
            if attempt < INSTALL_ATTEMPTS {
                self.runner.sleep(self.retry_delay);
            }
        }

        report.warn(format!(
            "Package installation failed after {} attempts",
            INSTALL_ATTEMPTS
        ));
        false
    }

    /// Make sure a certbot new enough for IP certificates is available.
    ///
    /// Order: existing binary, distribution package, then a private virtual
    /// environment linked into /usr/local/bin.
    pub fn ensure_certificate_client(&self, report: &mut RunReport) -> Result<CertbotVersion> {
        if let Some(version) = self.certbot_version() {
            if version.is_supported() {
                info!("certbot {} is recent enough", version);
                return Ok(version);
            }
            report.warn(format!(
                "certbot {} is older than {}; IP certificates need a newer release",
                version, MIN_VERSION
            ));
        } else if let Some(package) = package_for(self.env.os_family, CERTBOT_REQUIREMENT) {
            self.install_packages(&[package.to_string()], report);
            if let Some(version) = self.certbot_version().filter(CertbotVersion::is_supported) {
                return Ok(version);
            }
        }

        self.install_certbot_venv(report)?;
        match self.certbot_version() {
            Some(version) if version.is_supported() => {
                info!(target: "audit", "certbot {} installed into {}", version, self.layout.certbot_venv_dir().display());
                Ok(version)
            }
            _ => {
                let missing = vec![format!("certbot>={}", MIN_VERSION)];
                report.suggest(manual_instructions(self.env, &[CERTBOT_REQUIREMENT.to_string()]));
                Err(IpcertError::UnresolvedDependencies(missing))
            }
        }
    }

    fn certbot_version(&self) -> Option<CertbotVersion> {
        CertbotClient::locate(self.layout, self.runner).version()
    }

    fn install_certbot_venv(&self, report: &mut RunReport) -> Result<()> {
        let venv = self.layout.certbot_venv_dir();
        let venv_str = venv.to_string_lossy().to_string();
        info!("Installing certbot into virtual environment {}", venv_str);

        let create = run_lenient(self.runner, "python3", &["-m", "venv", &venv_str]);
        if !create.success() {
            report.warn(format!("python3 -m venv failed ({})", create.status_text()));
            report.suggest("Install the python3 venv module (python3-venv on Debian/Ubuntu)");
            return Err(IpcertError::UnresolvedDependencies(vec![
                "python3-venv".to_string(),
            ]));
        }

        let pip = venv.join("bin/pip").to_string_lossy().to_string();
        let installed = (1..=INSTALL_ATTEMPTS).any(|attempt| {
            let out = run_lenient(self.runner, &pip, &["install", "--upgrade", "pip", "certbot"]);
            if !out.success() && attempt < INSTALL_ATTEMPTS {
                self.runner.sleep(self.retry_delay);
            }
            out.success()
        });
        if !installed {
            return Err(IpcertError::UnresolvedDependencies(vec![
                CERTBOT_REQUIREMENT.to_string()
            ]));
        }

        link_certbot(&venv.join("bin/certbot"), &self.layout.certbot_link())
    }
}

fn link_certbot(target: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).map_err(|e| IpcertError::io(parent, e))?;
    }
    if link.symlink_metadata().is_ok() {
        fs::remove_file(link).map_err(|e| IpcertError::io(link, e))?;
    }
    symlink(target, link).map_err(|e| IpcertError::io(link, e))
}

fn temp_space_mb(dir: &Path) -> Option<u64> {
    let stat = nix::sys::statvfs::statvfs(dir).ok()?;
    let bytes = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
    Some(bytes / (1024 * 1024))
}

/// `MemAvailable` from /proc/meminfo, Linux only
fn available_memory_mb(meminfo: &Path) -> Option<u64> {
    let text = fs::read_to_string(meminfo).ok()?;
    text.lines()
        .find(|l| l.starts_with("MemAvailable:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::InitSystem;
    use tempfile::TempDir;

    fn env(family: OsFamily, pm: PackageManager) -> EnvironmentDescriptor {
        EnvironmentDescriptor {
            os_family: family,
            os_name: family.to_string(),
            package_manager: pm,
            init_system: InitSystem::Systemd,
            architecture: "x86_64".into(),
        }
    }

    #[test]
    fn test_package_table() {
        assert_eq!(package_for(OsFamily::Debian, DNS_REQUIREMENT), Some("dnsutils"));
        assert_eq!(package_for(OsFamily::Redhat, DNS_REQUIREMENT), Some("bind-utils"));
        assert_eq!(package_for(OsFamily::Arch, "python3"), Some("python"));
        assert_eq!(package_for(OsFamily::Suse, CERTBOT_REQUIREMENT), Some("python3-certbot"));
        assert_eq!(package_for(OsFamily::Debian, "nonsense"), None);
    }

    #[test]
    fn test_manual_instructions_use_package_manager() {
        let text = manual_instructions(
            &env(OsFamily::Debian, PackageManager::Apt),
            &["curl".into(), DNS_REQUIREMENT.into()],
        );
        assert!(text.contains("apt-get install -y curl dnsutils"));

        let text = manual_instructions(
            &env(OsFamily::Unknown, PackageManager::Unknown),
            &["openssl".into()],
        );
        assert!(text.contains("openssl"));
        assert!(text.contains("pip install certbot"));
    }

    #[test]
    fn test_meminfo_parsing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("meminfo");
        fs::write(&path, "MemTotal: 2048000 kB\nMemAvailable: 524288 kB\n").unwrap();
        assert_eq!(available_memory_mb(&path), Some(512));
        assert_eq!(available_memory_mb(&temp.path().join("absent")), None);
    }

    #[test]
    fn test_link_certbot_replaces_existing() {
        let temp = TempDir::new().unwrap();
        let link = temp.path().join("usr/local/bin/certbot");
        fs::create_dir_all(link.parent().unwrap()).unwrap();
        fs::write(&link, "old").unwrap();

        let target = temp.path().join("venv/bin/certbot");
        link_certbot(&target, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), target);
    }
}
