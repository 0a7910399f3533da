//! Input Validator
//!
//! Pure functions that turn raw user text into typed, normalized values.
//! Nothing that fails here ever reaches a subprocess argument list.
//!
//! - IP addresses: strict IPv4 octet parse, then IPv6; private and reserved
//!   ranges are rejected outright (the CA will not issue for them)
//! - Email: length limits, one `@`, dotted domain, no dangerous sequences
//! - Paths: length limit, no shell metacharacters, no `..` components
//! - Numbers: integer-only, inclusive range

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_EMAIL_DOMAIN_LEN: usize = 253;
pub const MAX_PATH_LEN: usize = 4096;

/// Characters that would change meaning inside a shell command line
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '<', '>', '\n', '\r', '\0', '\\'];

/// Sequences that are never valid anywhere in an email address
const EMAIL_DENYLIST: &[&str] = &["..", "@.", ".@"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid {0} format: '{1}'")]
    InvalidFormat(&'static str, String),

    #[error("{0} contains forbidden content: {1}")]
    Forbidden(&'static str, String),

    #[error("{0} is a private or reserved address")]
    Private(String),

    #[error("{0} is too long ({1} characters, limit {2})")]
    TooLong(&'static str, usize, usize),

    #[error("{value} is outside the allowed range {min}..={max}")]
    OutOfRange { value: i64, min: i64, max: i64 },
}

// ============================================================================
// Typed values
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "IPv4"),
            IpVersion::V6 => write!(f, "IPv6"),
        }
    }
}

/// A syntactically valid IP address and its public/reserved classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpAddress {
    addr: IpAddr,
    is_public: bool,
}

impl IpAddress {
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn version(&self) -> IpVersion {
        match self.addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn is_public(&self) -> bool {
        self.is_public
    }

    /// Canonical text form (compressed, lowercase for IPv6)
    pub fn canonical(&self) -> String {
        self.addr.to_string()
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    local: String,
    domain: String,
}

impl EmailAddress {
    pub fn local_part(&self) -> &str {
        &self.local
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn as_string(&self) -> String {
        format!("{}@{}", self.local, self.domain)
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

/// How strict a path check is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathPolicy {
    /// Relative or absolute
    Any,
    /// Must be absolute (system locations such as a webroot)
    SystemAbsolute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafePath {
    path: PathBuf,
    is_absolute: bool,
    /// Advisory only; checked once at validation time
    exists: bool,
}

impl SafePath {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_absolute(&self) -> bool {
        self.is_absolute
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Path as a subprocess argument; always valid UTF-8 after validation
    pub fn as_arg(&self) -> &str {
        self.path.to_str().unwrap_or_default()
    }
}

/// What a raw string is supposed to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Ip,
    Email,
    Path(PathPolicy),
    Number { min: i64, max: i64 },
}

/// Normalized result of [`validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatedInput {
    Ip(IpAddress),
    Email(EmailAddress),
    Path(SafePath),
    Number(i64),
}

/// Validate `raw` as `kind`
pub fn validate(raw: &str, kind: InputKind) -> Result<ValidatedInput, ValidationError> {
    match kind {
        InputKind::Ip => validate_ip(raw).map(ValidatedInput::Ip),
        InputKind::Email => validate_email(raw).map(ValidatedInput::Email),
        InputKind::Path(policy) => validate_path(raw, policy).map(ValidatedInput::Path),
        InputKind::Number { min, max } => validate_number(raw, min, max).map(ValidatedInput::Number),
    }
}

// ============================================================================
// IP addresses
// ============================================================================

/// Parse and classify without rejecting reserved ranges
pub fn classify_ip(raw: &str) -> Result<IpAddress, ValidationError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ValidationError::InvalidFormat("IP address", raw.to_string()));
    }

    let addr = match parse_ipv4_strict(text) {
        Some(v4) => IpAddr::V4(v4),
        None => {
            if text.contains('%') {
                return Err(ValidationError::Forbidden(
                    "IP address",
                    "zone identifiers are not allowed".to_string(),
                ));
            }
            match text.parse::<Ipv6Addr>() {
                Ok(v6) => IpAddr::V6(v6),
                Err(_) => return Err(ValidationError::InvalidFormat("IP address", raw.to_string())),
            }
        }
    };

    Ok(IpAddress {
        addr,
        is_public: !is_reserved(addr),
    })
}

/// Parse, classify and require a public address
pub fn validate_ip(raw: &str) -> Result<IpAddress, ValidationError> {
    let ip = classify_ip(raw)?;
    if !ip.is_public() {
        debug!("rejecting reserved address {}", ip);
        return Err(ValidationError::Private(ip.canonical()));
    }
    Ok(ip)
}

/// Exactly four dot-separated decimal groups, each 0-255, no leading zeros
fn parse_ipv4_strict(text: &str) -> Option<Ipv4Addr> {
    let groups: Vec<&str> = text.split('.').collect();
    if groups.len() != 4 {
        return None;
    }

    let mut octets = [0u8; 4];
    for (slot, group) in octets.iter_mut().zip(&groups) {
        if group.is_empty() || group.len() > 3 || !group.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if group.len() > 1 && group.starts_with('0') {
            return None;
        }
        let value: u16 = group.parse().ok()?;
        if value > 255 {
            return None;
        }
        *slot = value as u8;
    }

    Some(Ipv4Addr::from(octets))
}

/// Whether an address falls in a private, loopback or otherwise reserved block
pub fn is_reserved(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => is_reserved_v4(v4),
        IpAddr::V6(v6) => is_reserved_v6(v6),
    }
}

fn is_reserved_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    a == 0                                  // 0.0.0.0/8 "this network"
        || a == 10                          // RFC1918
        || (a == 100 && (b & 0xc0) == 64)   // 100.64.0.0/10 shared address space
        || a == 127                         // loopback
        || (a == 169 && b == 254)           // link-local
        || (a == 172 && (b & 0xf0) == 16)   // RFC1918
        || (a == 192 && b == 0 && c == 0)   // 192.0.0.0/24 IETF protocol assignments
        || (a == 192 && b == 168)           // RFC1918
        || (a == 198 && (b & 0xfe) == 18)   // 198.18.0.0/15 benchmarking
        || a >= 224                         // multicast, 240/4 reserved, broadcast
}

fn is_reserved_v6(ip: Ipv6Addr) -> bool {
    if ip.is_unspecified() || ip.is_loopback() {
        return true;
    }
    if let Some(v4) = embedded_v4(ip) {
        return is_reserved_v4(v4);
    }
    let first = ip.segments()[0];
    (first & 0xffc0) == 0xfe80          // fe80::/10 link-local
        || (first & 0xfe00) == 0xfc00   // fc00::/7 unique local (covers fd00::/8)
        || (first & 0xff00) == 0xff00   // multicast
}

/// IPv4 address carried inside a v6 one: v4-mapped, v4-compatible, 6to4 or
/// the NAT64 well-known prefix
fn embedded_v4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let seg = ip.segments();
    let low = Ipv4Addr::from(u128::from(ip) as u32);
    match seg {
        [0, 0, 0, 0, 0, 0, _, _] => Some(low),
        [0x2002, hi, lo, ..] => Some(Ipv4Addr::from(((hi as u32) << 16) | lo as u32)),
        [0x64, 0xff9b, 0, 0, 0, 0, _, _] => Some(low),
        _ => None,
    }
}

// ============================================================================
// Email
// ============================================================================

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)*\.[A-Za-z]{2,}$",
        )
        .expect("static email pattern compiles")
    })
}

pub fn validate_email(raw: &str) -> Result<EmailAddress, ValidationError> {
    let text = raw.trim();

    if text.len() > MAX_EMAIL_LEN {
        return Err(ValidationError::TooLong("email", text.len(), MAX_EMAIL_LEN));
    }
    if text.is_empty() {
        return Err(ValidationError::InvalidFormat("email", raw.to_string()));
    }

    if text.matches('@').count() > 1 {
        return Err(ValidationError::Forbidden("email", "more than one '@'".to_string()));
    }
    for bad in EMAIL_DENYLIST {
        if text.contains(bad) {
            return Err(ValidationError::Forbidden("email", format!("contains '{}'", bad)));
        }
    }
    if text.starts_with('.') || text.ends_with('.') {
        return Err(ValidationError::Forbidden(
            "email",
            "leading or trailing dot".to_string(),
        ));
    }

    let (local, domain) = text
        .split_once('@')
        .ok_or_else(|| ValidationError::InvalidFormat("email", raw.to_string()))?;

    if domain.len() > MAX_EMAIL_DOMAIN_LEN {
        return Err(ValidationError::TooLong(
            "email domain",
            domain.len(),
            MAX_EMAIL_DOMAIN_LEN,
        ));
    }
    if !domain.contains('.') || !email_regex().is_match(text) {
        return Err(ValidationError::InvalidFormat("email", raw.to_string()));
    }

    Ok(EmailAddress {
        local: local.to_string(),
        domain: domain.to_ascii_lowercase(),
    })
}

// ============================================================================
// Paths
// ============================================================================

pub fn validate_path(raw: &str, policy: PathPolicy) -> Result<SafePath, ValidationError> {
    if raw.len() > MAX_PATH_LEN {
        return Err(ValidationError::TooLong("path", raw.len(), MAX_PATH_LEN));
    }
    if raw.trim().is_empty() {
        return Err(ValidationError::InvalidFormat("path", raw.to_string()));
    }

    if let Some(c) = raw.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(ValidationError::Forbidden(
            "path",
            format!("shell metacharacter {:?}", c),
        ));
    }
    if raw.contains("$(") || raw.contains("${") {
        return Err(ValidationError::Forbidden(
            "path",
            "command substitution".to_string(),
        ));
    }

    let path = PathBuf::from(raw);
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ValidationError::Forbidden(
            "path",
            "directory traversal ('..')".to_string(),
        ));
    }

    let is_absolute = path.is_absolute();
    if policy == PathPolicy::SystemAbsolute && !is_absolute {
        return Err(ValidationError::InvalidFormat(
            "absolute path",
            raw.to_string(),
        ));
    }

    let exists = path.exists();
    if !exists {
        debug!("path {} does not exist yet", raw);
    }

    Ok(SafePath {
        path,
        is_absolute,
        exists,
    })
}

// ============================================================================
// Numbers
// ============================================================================

pub fn validate_number(raw: &str, min: i64, max: i64) -> Result<i64, ValidationError> {
    let text = raw.trim();
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::InvalidFormat("number", raw.to_string()));
    }

    let value: i64 = text
        .parse()
        .map_err(|_| ValidationError::InvalidFormat("number", raw.to_string()))?;

    if value < min || value > max {
        return Err(ValidationError::OutOfRange { value, min, max });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------
    // IP
    // ------------------------------------------------------------------

    #[test]
    fn test_private_and_reserved_ipv4_rejected() {
        let reserved = [
            "10.0.0.1",
            "10.255.255.255",
            "172.16.0.1",
            "172.31.255.254",
            "192.168.1.50",
            "127.0.0.1",
            "127.8.9.10",
            "169.254.10.10",
            "0.0.0.0",
            "100.64.0.1",
            "198.18.0.5",
            "224.0.0.1",
            "255.255.255.255",
        ];
        for raw in reserved {
            match validate_ip(raw) {
                Err(ValidationError::Private(addr)) => assert_eq!(addr, raw),
                other => panic!("{} should be private, got {:?}", raw, other),
            }
        }
    }

    #[test]
    fn test_private_and_reserved_ipv6_rejected() {
        for raw in ["::1", "::", "fe80::1", "febf::1", "fc00::1", "fd12:3456::1", "ff02::1", "::ffff:192.168.0.1"] {
            assert!(
                matches!(validate_ip(raw), Err(ValidationError::Private(_))),
                "{} should be private",
                raw
            );
        }
    }

    #[test]
    fn test_private_v4_inside_v6_rejected() {
        for raw in [
            "::10.0.0.1",
            "::127.0.0.1",
            "2002:c0a8:0101::1",
            "2002:0a00:0001:1::",
            "64:ff9b::192.168.1.1",
            "64:ff9b::7f00:1",
        ] {
            assert!(
                matches!(validate_ip(raw), Err(ValidationError::Private(_))),
                "{} should be private",
                raw
            );
        }
        for raw in ["64:ff9b::203.0.113.10", "2002:0808:0808::1", "::8.8.8.8"] {
            assert!(validate_ip(raw).is_ok(), "{} should be public", raw);
        }
    }

    #[test]
    fn test_rfc1918_boundaries_are_public() {
        for raw in ["172.15.255.255", "172.32.0.1", "11.0.0.1", "192.169.0.1", "100.128.0.1"] {
            assert!(validate_ip(raw).is_ok(), "{} should be public", raw);
        }
    }

    #[test]
    fn test_public_addresses_round_trip() {
        let samples = [
            ("8.8.8.8", "8.8.8.8"),
            ("198.51.100.7", "198.51.100.7"),
            (" 203.0.113.10 ", "203.0.113.10"),
            ("2606:4700:0000:0000:0000:0000:0000:1111", "2606:4700::1111"),
            ("2001:DB8::1", "2001:db8::1"),
            ("::ffff:8.8.4.4", "::ffff:8.8.4.4"),
        ];
        for (raw, canonical) in samples {
            let ip = validate_ip(raw).unwrap();
            assert!(ip.is_public());
            assert_eq!(ip.canonical(), canonical);
            // parse(format(x)) == x
            assert_eq!(validate_ip(&ip.canonical()).unwrap(), ip);
        }
    }

    #[test]
    fn test_ip_versions() {
        assert_eq!(validate_ip("1.1.1.1").unwrap().version(), IpVersion::V4);
        assert_eq!(validate_ip("2a00:1450::1").unwrap().version(), IpVersion::V6);
    }

    #[test]
    fn test_malformed_ipv4_rejected() {
        for raw in ["256.1.1.1", "1.2.3", "1.2.3.4.5", "01.2.3.4", "1.2.3.-4", "a.b.c.d", "", "1..2.3"] {
            assert!(
                matches!(classify_ip(raw), Err(ValidationError::InvalidFormat(..))),
                "{:?} should be malformed",
                raw
            );
        }
    }

    #[test]
    fn test_ipv6_zone_and_injection_rejected() {
        assert!(matches!(classify_ip("fe80::1%eth0"), Err(ValidationError::Forbidden(..))));
        assert!(classify_ip("1.2.3.4; rm -rf /").is_err());
        assert!(classify_ip("2001:db8::1::2").is_err());
    }

    // ------------------------------------------------------------------
    // Email
    // ------------------------------------------------------------------

    #[test]
    fn test_valid_email() {
        let email = validate_email(" admin@Example.org ").unwrap();
        assert_eq!(email.local_part(), "admin");
        assert_eq!(email.domain(), "example.org");
        assert_eq!(email.to_string(), "admin@example.org");
        assert!(validate_email("first.last+tag@mail.example.co.uk").is_ok());
    }

    #[test]
    fn test_email_without_dot_in_domain_rejected() {
        for raw in ["root@localhost", "a@b", "user@example"] {
            assert!(validate_email(raw).is_err(), "{} should be rejected", raw);
        }
    }

    #[test]
    fn test_email_too_long_rejected_even_if_well_formed() {
        let local = "a".repeat(60);
        let domain = format!("{}.com", "b".repeat(200));
        let email = format!("{}@{}", local, domain);
        assert!(email.len() > MAX_EMAIL_LEN);
        assert!(matches!(validate_email(&email), Err(ValidationError::TooLong(..))));
    }

    #[test]
    fn test_email_dangerous_sequences_rejected() {
        for raw in ["a..b@example.com", ".a@example.com", "a.@example.com", "a@.example.com", "a@@example.com", "a@b@example.com", "a@example.com."] {
            assert!(
                matches!(validate_email(raw), Err(ValidationError::Forbidden(..))),
                "{} should be forbidden",
                raw
            );
        }
    }

    #[test]
    fn test_email_with_shell_content_rejected() {
        assert!(validate_email("a$(id)@example.com").is_err());
        assert!(validate_email("a b@example.com").is_err());
    }

    // ------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------

    #[test]
    fn test_valid_paths() {
        let p = validate_path("/var/www/html", PathPolicy::SystemAbsolute).unwrap();
        assert!(p.is_absolute());
        assert_eq!(p.as_arg(), "/var/www/html");

        let rel = validate_path("site/public", PathPolicy::Any).unwrap();
        assert!(!rel.is_absolute());
        assert!(!rel.exists());
    }

    #[test]
    fn test_relative_path_rejected_for_system_policy() {
        assert!(matches!(
            validate_path("www", PathPolicy::SystemAbsolute),
            Err(ValidationError::InvalidFormat(..))
        ));
    }

    #[test]
    fn test_path_metacharacters_and_traversal_rejected() {
        for raw in ["/var/www;reboot", "/tmp/`id`", "/tmp/$(id)", "/a|b", "/a&b", "/var/www/../../etc", "../etc", "/tmp/x\ny"] {
            assert!(
                matches!(validate_path(raw, PathPolicy::Any), Err(ValidationError::Forbidden(..))),
                "{:?} should be forbidden",
                raw
            );
        }
    }

    #[test]
    fn test_path_too_long() {
        let long = format!("/{}", "a".repeat(MAX_PATH_LEN));
        assert!(matches!(validate_path(&long, PathPolicy::Any), Err(ValidationError::TooLong(..))));
    }

    #[test]
    fn test_existing_path_flag() {
        let dir = tempfile::TempDir::new().unwrap();
        let p = validate_path(dir.path().to_str().unwrap(), PathPolicy::SystemAbsolute).unwrap();
        assert!(p.exists());
    }

    // ------------------------------------------------------------------
    // Numbers
    // ------------------------------------------------------------------

    #[test]
    fn test_numbers() {
        assert_eq!(validate_number("4096", 1024, 8192).unwrap(), 4096);
        assert_eq!(validate_number("-3", -5, 5).unwrap(), -3);
        assert_eq!(validate_number("10", 10, 10).unwrap(), 10);
        assert!(matches!(validate_number("11", 0, 10), Err(ValidationError::OutOfRange { .. })));
        assert!(matches!(validate_number("1.5", 0, 10), Err(ValidationError::InvalidFormat(..))));
        assert!(matches!(validate_number("1e3", 0, 10000), Err(ValidationError::InvalidFormat(..))));
        assert!(validate_number("", 0, 1).is_err());
    }

    #[test]
    fn test_validate_dispatch() {
        assert!(matches!(validate("8.8.8.8", InputKind::Ip), Ok(ValidatedInput::Ip(_))));
        assert!(matches!(validate("a@b.io", InputKind::Email), Ok(ValidatedInput::Email(_))));
        assert!(matches!(
            validate("7", InputKind::Number { min: 1, max: 9 }),
            Ok(ValidatedInput::Number(7))
        ));
        assert!(matches!(
            validate("192.168.1.50", InputKind::Ip),
            Err(ValidationError::Private(_))
        ));
    }
}
