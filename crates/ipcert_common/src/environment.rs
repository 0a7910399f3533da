//! Environment Profiler
//!
//! Works out OS family, package manager, init system and architecture once
//! per process. Every later decision branches on the resulting
//! [`EnvironmentDescriptor`], which is never mutated.
//!
//! OS identification tries, in order: the os-release file, `lsb_release`,
//! distribution marker files, then `uname`/`sw_vers`. The first source that
//! yields a name wins and is classified through [`FAMILY_TABLE`]. Names the
//! table does not know fall back to probing package manager binaries.

use std::fmt;
use std::fs;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{IpcertError, Result};
use crate::exec::{run_lenient, CommandRunner};
use crate::paths::Layout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Debian,
    Redhat,
    Suse,
    Arch,
    Alpine,
    Gentoo,
    FreeBsd,
    OpenBsd,
    NetBsd,
    DragonFly,
    MacOs,
    Unknown,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Debian => "debian",
            OsFamily::Redhat => "redhat",
            OsFamily::Suse => "suse",
            OsFamily::Arch => "arch",
            OsFamily::Alpine => "alpine",
            OsFamily::Gentoo => "gentoo",
            OsFamily::FreeBsd => "freebsd",
            OsFamily::OpenBsd => "openbsd",
            OsFamily::NetBsd => "netbsd",
            OsFamily::DragonFly => "dragonfly",
            OsFamily::MacOs => "macos",
            OsFamily::Unknown => "unknown",
        }
    }

    pub fn is_bsd(&self) -> bool {
        matches!(
            self,
            OsFamily::FreeBsd | OsFamily::OpenBsd | OsFamily::NetBsd | OsFamily::DragonFly
        )
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
    Zypper,
    Pacman,
    Apk,
    Emerge,
    Pkg,
    PkgAdd,
    Pkgin,
    Brew,
    Unknown,
}

impl PackageManager {
    /// Binary that identifies this package manager
    pub fn binary(&self) -> &'static str {
        match self {
            PackageManager::Apt => "apt-get",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Zypper => "zypper",
            PackageManager::Pacman => "pacman",
            PackageManager::Apk => "apk",
            PackageManager::Emerge => "emerge",
            PackageManager::Pkg => "pkg",
            PackageManager::PkgAdd => "pkg_add",
            PackageManager::Pkgin => "pkgin",
            PackageManager::Brew => "brew",
            PackageManager::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InitSystem {
    Systemd,
    OpenRc,
    SysV,
    BsdRc,
    Launchd,
    Unknown,
}

impl InitSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitSystem::Systemd => "systemd",
            InitSystem::OpenRc => "openrc",
            InitSystem::SysV => "sysv",
            InitSystem::BsdRc => "bsd_rc",
            InitSystem::Launchd => "launchd",
            InitSystem::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InitSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentDescriptor {
    pub os_family: OsFamily,
    /// Name reported by the winning identification source
    pub os_name: String,
    pub package_manager: PackageManager,
    pub init_system: InitSystem,
    pub architecture: String,
}

impl EnvironmentDescriptor {
    pub fn is_32bit(&self) -> bool {
        is_32bit_arch(&self.architecture)
    }

    pub fn is_arm(&self) -> bool {
        let arch = self.architecture.to_ascii_lowercase();
        arch.starts_with("arm") || arch.starts_with("aarch64")
    }
}

// ============================================================================
// Classification tables
// ============================================================================

/// Name fragment -> family, matched case-insensitively in order
pub const FAMILY_TABLE: &[(&str, OsFamily)] = &[
    ("ubuntu", OsFamily::Debian),
    ("debian", OsFamily::Debian),
    ("raspbian", OsFamily::Debian),
    ("linux mint", OsFamily::Debian),
    ("pop!_os", OsFamily::Debian),
    ("elementary", OsFamily::Debian),
    ("kali", OsFamily::Debian),
    ("red hat", OsFamily::Redhat),
    ("redhat", OsFamily::Redhat),
    ("rhel", OsFamily::Redhat),
    ("centos", OsFamily::Redhat),
    ("fedora", OsFamily::Redhat),
    ("rocky", OsFamily::Redhat),
    ("almalinux", OsFamily::Redhat),
    ("oracle linux", OsFamily::Redhat),
    ("amazon linux", OsFamily::Redhat),
    ("suse", OsFamily::Suse),
    ("sles", OsFamily::Suse),
    ("arch", OsFamily::Arch),
    ("manjaro", OsFamily::Arch),
    ("endeavouros", OsFamily::Arch),
    ("alpine", OsFamily::Alpine),
    ("gentoo", OsFamily::Gentoo),
    ("freebsd", OsFamily::FreeBsd),
    ("openbsd", OsFamily::OpenBsd),
    ("netbsd", OsFamily::NetBsd),
    ("dragonfly", OsFamily::DragonFly),
    ("darwin", OsFamily::MacOs),
    ("macos", OsFamily::MacOs),
    ("mac os", OsFamily::MacOs),
];

/// Probe order when the OS name is not in [`FAMILY_TABLE`]
const PACKAGE_MANAGER_PROBES: &[(PackageManager, OsFamily)] = &[
    (PackageManager::Apt, OsFamily::Debian),
    (PackageManager::Dnf, OsFamily::Redhat),
    (PackageManager::Yum, OsFamily::Redhat),
    (PackageManager::Zypper, OsFamily::Suse),
    (PackageManager::Pacman, OsFamily::Arch),
    (PackageManager::Apk, OsFamily::Alpine),
    (PackageManager::Emerge, OsFamily::Gentoo),
    (PackageManager::Pkg, OsFamily::FreeBsd),
    (PackageManager::PkgAdd, OsFamily::OpenBsd),
    (PackageManager::Pkgin, OsFamily::NetBsd),
    (PackageManager::Brew, OsFamily::MacOs),
];

/// Marker file -> fallback name when the file is empty
const MARKER_FILES: &[(&str, &str)] = &[
    ("/etc/redhat-release", "Red Hat"),
    ("/etc/debian_version", "Debian"),
    ("/etc/SuSE-release", "SUSE"),
    ("/etc/arch-release", "Arch Linux"),
    ("/etc/alpine-release", "Alpine Linux"),
    ("/etc/gentoo-release", "Gentoo"),
];

/// Classify a free-form OS name
pub fn classify_family(name: &str) -> Option<OsFamily> {
    let lowered = name.to_ascii_lowercase();
    FAMILY_TABLE
        .iter()
        .find(|(fragment, _)| lowered.contains(fragment))
        .map(|(_, family)| *family)
}

fn is_32bit_arch(arch: &str) -> bool {
    matches!(
        arch.to_ascii_lowercase().as_str(),
        "i386" | "i486" | "i586" | "i686" | "x86" | "armv6l" | "armv7l" | "armhf" | "arm"
    )
}

// ============================================================================
// Profiler
// ============================================================================

pub struct EnvironmentProfiler<'a> {
    layout: &'a Layout,
    runner: &'a dyn CommandRunner,
}

impl<'a> EnvironmentProfiler<'a> {
    pub fn new(layout: &'a Layout, runner: &'a dyn CommandRunner) -> Self {
        Self { layout, runner }
    }

    pub fn profile(&self) -> Result<EnvironmentDescriptor> {
        let identified = self.identify_os();
        let (os_family, os_name) = match &identified {
            Some((name, family)) => (*family, name.clone()),
            None => (OsFamily::Unknown, String::new()),
        };

        let (os_family, package_manager) = self.resolve_package_manager(os_family);

        // uname is the last identification source, so nothing answered at all
        if identified.is_none() && package_manager == PackageManager::Unknown {
            warn!("No OS identification source answered");
            return Err(IpcertError::EnvironmentUndetectable);
        }

        let os_name = if os_name.is_empty() {
            os_family.as_str().to_string()
        } else {
            os_name
        };

        let descriptor = EnvironmentDescriptor {
            os_family,
            os_name,
            package_manager,
            init_system: self.detect_init(os_family),
            architecture: self.detect_arch(),
        };

        if descriptor.is_32bit() {
            warn!(
                "32-bit architecture ({}): certbot builds may be unavailable",
                descriptor.architecture
            );
        } else if descriptor.is_arm() {
            warn!(
                "ARM architecture ({}): some certbot packages may lag behind",
                descriptor.architecture
            );
        }

        info!(
            "Environment: {} ({}), pkg={}, init={}, arch={}",
            descriptor.os_name,
            descriptor.os_family,
            descriptor.package_manager,
            descriptor.init_system,
            descriptor.architecture
        );
        Ok(descriptor)
    }

    /// First identification source with an answer wins
    fn identify_os(&self) -> Option<(String, OsFamily)> {
        let name = self
            .from_os_release()
            .or_else(|| self.from_lsb_release())
            .or_else(|| self.from_marker_files())
            .or_else(|| self.from_kernel())?;

        let family = classify_family(&name.classify_text).unwrap_or(OsFamily::Unknown);
        debug!("identified '{}' via {} as {}", name.display, name.source, family);
        Some((name.display, family))
    }

    fn from_os_release(&self) -> Option<OsName> {
        ["/etc/os-release", "/usr/lib/os-release"]
            .iter()
            .find_map(|p| fs::read_to_string(self.layout.resolve(p)).ok())
            .and_then(|text| parse_os_release(&text))
    }

    fn from_lsb_release(&self) -> Option<OsName> {
        if !self.runner.exists("lsb_release") {
            return None;
        }
        self.command_line("lsb_release", &["-si"])
            .map(|name| OsName::plain(name, "lsb_release"))
    }

    fn from_marker_files(&self) -> Option<OsName> {
        MARKER_FILES.iter().find_map(|(marker, fallback)| {
            let path = self.layout.resolve(marker);
            if !path.is_file() {
                return None;
            }
            let first_line = fs::read_to_string(&path)
                .ok()
                .and_then(|t| t.lines().next().map(|l| l.trim().to_string()))
                .filter(|l| !l.is_empty() && classify_family(l).is_some());
            // debian_version holds only a number, so always keep the family hint
            let display = first_line.unwrap_or_else(|| fallback.to_string());
            Some(OsName {
                classify_text: format!("{} {}", display, fallback),
                display,
                source: "marker file",
            })
        })
    }

    fn from_kernel(&self) -> Option<OsName> {
        let kernel = self.command_line("uname", &["-s"])?;
        if kernel.eq_ignore_ascii_case("darwin") {
            let product = self
                .command_line("sw_vers", &["-productName"])
                .unwrap_or_else(|| "macOS".to_string());
            return Some(OsName {
                classify_text: format!("{} darwin", product),
                display: product,
                source: "sw_vers",
            });
        }
        Some(OsName::plain(kernel, "uname"))
    }

    fn resolve_package_manager(&self, family: OsFamily) -> (OsFamily, PackageManager) {
        let manager = match family {
            OsFamily::Debian => PackageManager::Apt,
            OsFamily::Redhat => {
                if self.runner.exists("dnf") {
                    PackageManager::Dnf
                } else {
                    PackageManager::Yum
                }
            }
            OsFamily::Suse => PackageManager::Zypper,
            OsFamily::Arch => PackageManager::Pacman,
            OsFamily::Alpine => PackageManager::Apk,
            OsFamily::Gentoo => PackageManager::Emerge,
            OsFamily::FreeBsd | OsFamily::DragonFly => PackageManager::Pkg,
            OsFamily::OpenBsd => PackageManager::PkgAdd,
            OsFamily::NetBsd => PackageManager::Pkgin,
            OsFamily::MacOs => PackageManager::Brew,
            OsFamily::Unknown => {
                return PACKAGE_MANAGER_PROBES
                    .iter()
                    .find(|(pm, _)| self.runner.exists(pm.binary()))
                    .map(|(pm, fam)| {
                        info!("Unrecognised OS, classified as {} from {}", fam, pm);
                        (*fam, *pm)
                    })
                    .unwrap_or((OsFamily::Unknown, PackageManager::Unknown));
            }
        };
        (family, manager)
    }

    /// Supervisor socket dirs, then marker files, then binaries
    fn detect_init(&self, family: OsFamily) -> InitSystem {
        if self.layout.resolve("/run/systemd/system").is_dir() {
            return InitSystem::Systemd;
        }
        if self.layout.resolve("/run/openrc").is_dir()
            || self.layout.resolve("/sbin/openrc-run").exists()
        {
            return InitSystem::OpenRc;
        }

        if family.is_bsd() && self.layout.resolve("/etc/rc.conf").exists() {
            return InitSystem::BsdRc;
        }
        if family == OsFamily::MacOs || self.layout.resolve("/sbin/launchd").exists() {
            return InitSystem::Launchd;
        }
        if self.layout.resolve("/etc/inittab").is_file() {
            return InitSystem::SysV;
        }

        const BINARIES: &[(&str, InitSystem)] = &[
            ("systemctl", InitSystem::Systemd),
            ("rc-service", InitSystem::OpenRc),
            ("launchctl", InitSystem::Launchd),
            ("service", InitSystem::SysV),
        ];
        if let Some((_, init)) = BINARIES.iter().find(|(bin, _)| self.runner.exists(bin)) {
            // `service` exists on the BSDs as well
            if *init == InitSystem::SysV && family.is_bsd() {
                return InitSystem::BsdRc;
            }
            return *init;
        }

        if family.is_bsd() {
            InitSystem::BsdRc
        } else {
            InitSystem::Unknown
        }
    }

    fn detect_arch(&self) -> String {
        self.command_line("uname", &["-m"])
            .unwrap_or_else(|| std::env::consts::ARCH.to_string())
    }

    /// First non-empty stdout line of a successful command
    fn command_line(&self, program: &str, args: &[&str]) -> Option<String> {
        let output = run_lenient(self.runner, program, args);
        if !output.success() {
            return None;
        }
        output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    }
}

struct OsName {
    display: String,
    /// Text matched against the family table
    classify_text: String,
    source: &'static str,
}

impl OsName {
    fn plain(name: String, source: &'static str) -> Self {
        Self {
            classify_text: name.clone(),
            display: name,
            source,
        }
    }
}

fn parse_os_release(text: &str) -> Option<OsName> {
    let mut name = None;
    let mut pretty = None;
    let mut id = String::new();
    let mut id_like = String::new();

    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'').to_string();
        match key.trim() {
            "NAME" => name = Some(value),
            "PRETTY_NAME" => pretty = Some(value),
            "ID" => id = value,
            "ID_LIKE" => id_like = value,
            _ => {}
        }
    }

    let display = pretty.or(name.clone())?;
    // Matched as one string: FAMILY_TABLE order, not field order, picks the family
    let classify_text = format!(
        "{} {} {}",
        name.unwrap_or_default(),
        id,
        id_like
    );
    Some(OsName {
        display,
        classify_text,
        source: "os-release",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use std::collections::HashMap;
    use std::io;
    use std::path::Path;
    use tempfile::TempDir;

    /// Answers commands from a table; anything else fails to spawn
    #[derive(Default)]
    struct TableRunner {
        outputs: HashMap<String, String>,
        binaries: Vec<&'static str>,
    }

    impl TableRunner {
        fn answer(mut self, cmd: &str, stdout: &str) -> Self {
            self.outputs.insert(cmd.to_string(), stdout.to_string());
            self
        }

        fn with_binary(mut self, bin: &'static str) -> Self {
            self.binaries.push(bin);
            self
        }
    }

    impl CommandRunner for TableRunner {
        fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
            let key = format!("{} {}", program, args.join(" "));
            self.outputs
                .get(&key)
                .map(|out| CommandOutput::ok(out.clone()))
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, key))
        }
        fn run_with_input(&self, p: &str, a: &[&str], _: &str) -> io::Result<CommandOutput> {
            self.run(p, a)
        }
        fn spawn_detached(&self, _: &str, _: &[&str]) -> io::Result<()> {
            Ok(())
        }
        fn exists(&self, program: &str) -> bool {
            self.binaries.contains(&program) || self.outputs.keys().any(|k| k.starts_with(program))
        }
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel.trim_start_matches('/'));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_family_table() {
        assert_eq!(classify_family("Ubuntu 24.04 LTS"), Some(OsFamily::Debian));
        assert_eq!(classify_family("Rocky Linux"), Some(OsFamily::Redhat));
        assert_eq!(classify_family("openSUSE Leap"), Some(OsFamily::Suse));
        assert_eq!(classify_family("FreeBSD"), Some(OsFamily::FreeBsd));
        assert_eq!(classify_family("Darwin"), Some(OsFamily::MacOs));
        assert_eq!(classify_family("Plan 9"), None);
    }

    #[test]
    fn test_table_order_decides_match() {
        // "debian" sits above "rocky" in the table
        assert_eq!(classify_family("Rocky Linux rocky debian"), Some(OsFamily::Debian));
        assert_eq!(classify_family("Manjaro Linux manjaro arch"), Some(OsFamily::Arch));
    }

    #[test]
    fn test_os_release_with_systemd() {
        let temp = TempDir::new().unwrap();
        write(
            temp.path(),
            "/etc/os-release",
            "NAME=\"Ubuntu\"\nPRETTY_NAME=\"Ubuntu 24.04 LTS\"\nID=ubuntu\nID_LIKE=debian\n",
        );
        fs::create_dir_all(temp.path().join("run/systemd/system")).unwrap();
        let layout = Layout::with_root(temp.path());
        let runner = TableRunner::default().answer("uname -m", "x86_64\n");

        let env = EnvironmentProfiler::new(&layout, &runner).profile().unwrap();
        assert_eq!(env.os_family, OsFamily::Debian);
        assert_eq!(env.os_name, "Ubuntu 24.04 LTS");
        assert_eq!(env.package_manager, PackageManager::Apt);
        assert_eq!(env.init_system, InitSystem::Systemd);
        assert_eq!(env.architecture, "x86_64");
    }

    #[test]
    fn test_derivative_falls_back_to_id_like() {
        let temp = TempDir::new().unwrap();
        write(
            temp.path(),
            "/etc/os-release",
            "NAME=\"Zorin OS\"\nID=zorin\nID_LIKE=\"ubuntu debian\"\n",
        );
        let layout = Layout::with_root(temp.path());
        let runner = TableRunner::default();
        let env = EnvironmentProfiler::new(&layout, &runner).profile().unwrap();
        assert_eq!(env.os_family, OsFamily::Debian);
    }

    #[test]
    fn test_marker_file_and_openrc() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "/etc/alpine-release", "3.20.1\n");
        fs::create_dir_all(temp.path().join("run/openrc")).unwrap();
        let layout = Layout::with_root(temp.path());
        let runner = TableRunner::default().answer("uname -m", "aarch64");

        let env = EnvironmentProfiler::new(&layout, &runner).profile().unwrap();
        assert_eq!(env.os_family, OsFamily::Alpine);
        assert_eq!(env.package_manager, PackageManager::Apk);
        assert_eq!(env.init_system, InitSystem::OpenRc);
        assert!(env.is_arm());
    }

    #[test]
    fn test_unknown_name_uses_package_manager_probe() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "/etc/os-release", "NAME=\"Homegrown\"\nID=homegrown\n");
        let layout = Layout::with_root(temp.path());
        let runner = TableRunner::default().with_binary("pacman");

        let env = EnvironmentProfiler::new(&layout, &runner).profile().unwrap();
        assert_eq!(env.os_family, OsFamily::Arch);
        assert_eq!(env.package_manager, PackageManager::Pacman);
    }

    #[test]
    fn test_bsd_via_uname() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "/etc/rc.conf", "sshd_enable=\"YES\"\n");
        let layout = Layout::with_root(temp.path());
        let runner = TableRunner::default()
            .answer("uname -s", "FreeBSD\n")
            .answer("uname -m", "amd64\n");

        let env = EnvironmentProfiler::new(&layout, &runner).profile().unwrap();
        assert_eq!(env.os_family, OsFamily::FreeBsd);
        assert_eq!(env.package_manager, PackageManager::Pkg);
        assert_eq!(env.init_system, InitSystem::BsdRc);
    }

    #[test]
    fn test_macos_via_sw_vers() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::with_root(temp.path());
        let runner = TableRunner::default()
            .answer("uname -s", "Darwin")
            .answer("sw_vers -productName", "macOS")
            .answer("uname -m", "arm64");

        let env = EnvironmentProfiler::new(&layout, &runner).profile().unwrap();
        assert_eq!(env.os_family, OsFamily::MacOs);
        assert_eq!(env.package_manager, PackageManager::Brew);
        assert_eq!(env.init_system, InitSystem::Launchd);
    }

    #[test]
    fn test_no_signal_is_undetectable() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::with_root(temp.path());
        let runner = TableRunner::default();
        let err = EnvironmentProfiler::new(&layout, &runner).profile().unwrap_err();
        assert!(matches!(err, IpcertError::EnvironmentUndetectable));
    }

    #[test]
    fn test_32bit_detection() {
        assert!(is_32bit_arch("i686"));
        assert!(is_32bit_arch("armv7l"));
        assert!(!is_32bit_arch("x86_64"));
    }
}
