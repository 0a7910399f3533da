//! certbot subprocess contract
//!
//! Argument vectors are built by pure functions so the exact invocation can
//! be asserted in tests; only [`CertbotClient`] touches the runner.

use std::fmt;
use std::io;

use tracing::info;

use crate::config::KeySize;
use crate::exec::{run_lenient, CommandOutput, CommandRunner};
use crate::paths::Layout;
use crate::validation::{EmailAddress, IpAddress, SafePath};

/// ACME directory of the staging environment
pub const STAGING_DIRECTORY: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Profile the CA requires for IP identifiers
pub const REQUIRED_PROFILE: &str = "shortlived";

/// First certbot release with `--ip-address` and profile selection
pub const MIN_VERSION: CertbotVersion = CertbotVersion {
    major: 5,
    minor: 0,
    patch: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CertbotVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl CertbotVersion {
    /// Parse `certbot 5.1.0` (or a bare `5.1.0`)
    pub fn parse(text: &str) -> Option<Self> {
        let token = text
            .split_whitespace()
            .find(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))?;
        let mut parts = token.split('.').map(|p| {
            let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().ok()
        });
        let major = parts.next()??;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    pub fn is_supported(&self) -> bool {
        *self >= MIN_VERSION
    }
}

impl fmt::Display for CertbotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// How certbot answers the HTTP-01 challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authenticator {
    /// Files under the webroot, served by the running web server
    Webroot { server: &'static str, webroot: SafePath },
    /// certbot binds port 80 itself
    Standalone,
}

impl Authenticator {
    pub fn describe(&self) -> String {
        match self {
            Authenticator::Webroot { server, webroot } => {
                format!("webroot via {} ({})", server, webroot.as_arg())
            }
            Authenticator::Standalone => "standalone".to_string(),
        }
    }
}

/// Everything that shapes one issuance call
#[derive(Debug, Clone)]
pub struct IssueRequest<'a> {
    pub ip: &'a IpAddress,
    pub email: &'a EmailAddress,
    pub key_size: KeySize,
    pub authenticator: &'a Authenticator,
    pub deploy_hook: Option<&'a str>,
}

/// `certbot certonly` arguments for `request`
pub fn issue_args(request: &IssueRequest<'_>) -> Vec<String> {
    let mut args: Vec<String> = [
        "certonly",
        "--non-interactive",
        "--agree-tos",
        "--staging",
        "--required-profile",
        REQUIRED_PROFILE,
        "--preferred-challenges",
        "http",
        "--key-type",
        "rsa",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push("--rsa-key-size".into());
    args.push(request.key_size.bits().to_string());
    args.push("--email".into());
    args.push(request.email.as_string());
    args.push("--ip-address".into());
    args.push(request.ip.canonical());

    match request.authenticator {
        Authenticator::Webroot { webroot, .. } => {
            args.push("--webroot".into());
            args.push("-w".into());
            args.push(webroot.as_arg().to_string());
        }
        Authenticator::Standalone => args.push("--standalone".into()),
    }

    if let Some(hook) = request.deploy_hook {
        args.push("--deploy-hook".into());
        args.push(hook.to_string());
    }
    args
}

/// `certbot renew` arguments
pub fn renew_args(dry_run: bool, force: bool, deploy_hook: Option<&str>) -> Vec<String> {
    let mut args = vec!["renew".to_string(), "--non-interactive".to_string()];
    // Jitter is applied by ipcertctl before the lock is taken
    args.push("--no-random-sleep-on-renew".into());
    if dry_run {
        args.push("--dry-run".into());
    } else {
        if force {
            args.push("--force-renewal".into());
        }
        if let Some(hook) = deploy_hook {
            args.push("--deploy-hook".into());
            args.push(hook.to_string());
        }
    }
    args
}

/// One entry of `certbot certificates`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateInfo {
    pub name: String,
    pub identifiers: Vec<String>,
    pub expiry: Option<String>,
    pub certificate_path: Option<String>,
    pub key_path: Option<String>,
}

/// Parse the human-readable `certbot certificates` listing
pub fn parse_certificates(stdout: &str) -> Vec<CertificateInfo> {
    let mut certs = Vec::new();
    let mut current: Option<CertificateInfo> = None;

    for line in stdout.lines() {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "Certificate Name" => {
                if let Some(done) = current.take() {
                    certs.push(done);
                }
                current = Some(CertificateInfo {
                    name: value,
                    ..Default::default()
                });
            }
            "Identifiers" | "Domains" => {
                if let Some(cert) = current.as_mut() {
                    cert.identifiers = value.split_whitespace().map(str::to_string).collect();
                }
            }
            "Expiry Date" => {
                if let Some(cert) = current.as_mut() {
                    cert.expiry = Some(value);
                }
            }
            "Certificate Path" => {
                if let Some(cert) = current.as_mut() {
                    cert.certificate_path = Some(value);
                }
            }
            "Private Key Path" => {
                if let Some(cert) = current.as_mut() {
                    cert.key_path = Some(value);
                }
            }
            _ => {}
        }
    }
    certs.extend(current);
    certs
}

/// Handle on the certbot binary
pub struct CertbotClient<'a> {
    program: String,
    runner: &'a dyn CommandRunner,
}

impl<'a> CertbotClient<'a> {
    /// Prefer the venv symlink ipcert manages, else whatever is on PATH
    pub fn locate(layout: &Layout, runner: &'a dyn CommandRunner) -> Self {
        let link = layout.certbot_link();
        let program = if link.exists() {
            link.to_string_lossy().to_string()
        } else {
            "certbot".to_string()
        };
        Self { program, runner }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn is_installed(&self) -> bool {
        self.runner.exists(&self.program)
    }

    pub fn version(&self) -> Option<CertbotVersion> {
        let out = run_lenient(self.runner, &self.program, &["--version"]);
        if !out.success() {
            return None;
        }
        // Older releases print the version on stderr
        CertbotVersion::parse(&out.combined())
    }

    fn run(&self, args: &[String]) -> io::Result<CommandOutput> {
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        info!("Running {} {}", self.program, refs.join(" "));
        self.runner.run(&self.program, &refs)
    }

    pub fn issue(&self, request: &IssueRequest<'_>) -> io::Result<CommandOutput> {
        self.run(&issue_args(request))
    }

    pub fn renew(
        &self,
        dry_run: bool,
        force: bool,
        deploy_hook: Option<&str>,
    ) -> io::Result<CommandOutput> {
        self.run(&renew_args(dry_run, force, deploy_hook))
    }

    /// `certbot certificates`, optionally filtered to one lineage
    pub fn certificates(&self, cert_name: Option<&str>) -> io::Result<CommandOutput> {
        let mut args = vec!["certificates".to_string()];
        if let Some(name) = cert_name {
            args.push("--cert-name".into());
            args.push(name.to_string());
        }
        self.run(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{validate_email, validate_ip, validate_path, PathPolicy};

    #[test]
    fn test_version_parsing() {
        assert_eq!(
            CertbotVersion::parse("certbot 5.1.0\n"),
            Some(CertbotVersion {
                major: 5,
                minor: 1,
                patch: 0
            })
        );
        assert!(!CertbotVersion::parse("certbot 2.11.0").unwrap().is_supported());
        assert!(CertbotVersion::parse("5.0.0").unwrap().is_supported());
        assert!(CertbotVersion::parse("certbot 6.0.dev0").unwrap().is_supported());
        assert_eq!(CertbotVersion::parse("certbot"), None);
    }

    #[test]
    fn test_issue_args_webroot() {
        let ip = validate_ip("2606:4700:0:0:0:0:0:1111").unwrap();
        let email = validate_email("Ops@Example.com").unwrap();
        let webroot = validate_path("/var/www/html", PathPolicy::SystemAbsolute).unwrap();
        let auth = Authenticator::Webroot {
            server: "nginx",
            webroot,
        };
        let args = issue_args(&IssueRequest {
            ip: &ip,
            email: &email,
            key_size: KeySize::Rsa4096,
            authenticator: &auth,
            deploy_hook: Some("systemctl reload nginx || true"),
        });
        let joined = args.join(" ");

        assert!(joined.starts_with("certonly --non-interactive --agree-tos --staging"));
        assert!(joined.contains("--required-profile shortlived"));
        assert!(joined.contains("--preferred-challenges http"));
        assert!(joined.contains("--rsa-key-size 4096"));
        assert!(joined.contains("--ip-address 2606:4700::1111"));
        assert!(joined.contains("--webroot -w /var/www/html"));
        assert_eq!(args.last().unwrap(), "systemctl reload nginx || true");
    }

    #[test]
    fn test_issue_args_standalone() {
        let ip = validate_ip("203.0.113.9").unwrap();
        let email = validate_email("ops@example.com").unwrap();
        let args = issue_args(&IssueRequest {
            ip: &ip,
            email: &email,
            key_size: KeySize::Rsa2048,
            authenticator: &Authenticator::Standalone,
            deploy_hook: None,
        });
        assert!(args.contains(&"--standalone".to_string()));
        assert!(!args.contains(&"--webroot".to_string()));
        assert!(!args.contains(&"--deploy-hook".to_string()));
    }

    #[test]
    fn test_renew_args() {
        let dry = renew_args(true, true, Some("true"));
        assert!(dry.contains(&"--dry-run".to_string()));
        assert!(!dry.contains(&"--force-renewal".to_string()));

        let real = renew_args(false, true, Some("true"));
        assert!(real.contains(&"--force-renewal".to_string()));
        assert!(real.contains(&"--deploy-hook".to_string()));
    }

    #[test]
    fn test_parse_certificates() {
        let listing = "\
Saving debug log to /var/log/letsencrypt/letsencrypt.log

- - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - -
Found the following certs:
  Certificate Name: 203.0.113.9
    Serial Number: 2b1c
    Key Type: RSA
    Identifiers: 203.0.113.9
    Expiry Date: 2026-10-23 10:00:00+00:00 (VALID: 5 days)
    Certificate Path: /etc/letsencrypt/live/203.0.113.9/fullchain.pem
    Private Key Path: /etc/letsencrypt/live/203.0.113.9/privkey.pem
  Certificate Name: 198.51.100.7
    Domains: 198.51.100.7
    Expiry Date: 2026-10-20 10:00:00+00:00 (VALID: 2 days)
";
        let certs = parse_certificates(listing);
        assert_eq!(certs.len(), 2);
        assert_eq!(certs[0].name, "203.0.113.9");
        assert_eq!(
            certs[0].certificate_path.as_deref(),
            Some("/etc/letsencrypt/live/203.0.113.9/fullchain.pem")
        );
        assert!(certs[1].expiry.as_deref().unwrap().contains("VALID: 2 days"));
        assert_eq!(certs[1].identifiers, vec!["198.51.100.7".to_string()]);
    }
}
