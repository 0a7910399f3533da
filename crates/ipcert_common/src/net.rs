//! Network probes used by pre-flight checks and the reachability gate.

use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::debug;

/// Timeout for the port 80 connect probe
pub const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for HTTPS requests
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Seam for every outbound network check
pub trait NetworkProbe {
    /// ICMP echo, advisory only
    fn ping(&self, ip: IpAddr) -> bool;

    /// TCP connect within `timeout`
    fn tcp_connect(&self, addr: SocketAddr, timeout: Duration) -> bool;

    /// Whether `host` resolves to at least one address
    fn resolve(&self, host: &str) -> bool;

    /// Whether an HTTPS GET to `url` gets any successful response
    fn https_reachable(&self, url: &str) -> bool;

    /// GET `url` and parse the body as JSON
    fn fetch_json(&self, url: &str) -> Result<serde_json::Value, String>;
}

/// Probes against the real network
pub struct SystemNetwork {
    client: Option<reqwest::blocking::Client>,
}

impl SystemNetwork {
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("ipcert/", env!("CARGO_PKG_VERSION")))
            .build()
            .ok();
        Self { client }
    }
}

impl Default for SystemNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkProbe for SystemNetwork {
    fn ping(&self, ip: IpAddr) -> bool {
        let mut cmd = Command::new("ping");
        if ip.is_ipv6() {
            cmd.arg("-6");
        }
        cmd.args(["-c", "1", "-W", "3"])
            .arg(ip.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn tcp_connect(&self, addr: SocketAddr, timeout: Duration) -> bool {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => true,
            Err(e) => {
                debug!("connect to {} failed: {}", addr, e);
                false
            }
        }
    }

    fn resolve(&self, host: &str) -> bool {
        (host, 443)
            .to_socket_addrs()
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false)
    }

    fn https_reachable(&self, url: &str) -> bool {
        let Some(client) = &self.client else {
            return false;
        };
        match client.get(url).send() {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("GET {} failed: {}", url, e);
                false
            }
        }
    }

    fn fetch_json(&self, url: &str) -> Result<serde_json::Value, String> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| "HTTP client unavailable".to_string())?;
        let resp = client.get(url).send().map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        resp.json::<serde_json::Value>().map_err(|e| e.to_string())
    }
}
