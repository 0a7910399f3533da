//! Scripted fakes for the host-facing traits.
//!
//! Every command, sleep and probe is recorded so scenarios can assert on
//! exactly what would have touched the host.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ipcert_common::environment::{EnvironmentDescriptor, InitSystem, OsFamily, PackageManager};
use ipcert_common::exec::{CommandOutput, CommandRunner};
use ipcert_common::net::NetworkProbe;

// ============================================================================
// Commands
// ============================================================================

#[derive(Default)]
pub struct FakeRunner {
    /// (command line prefix, response); first match wins
    responses: Vec<(String, CommandOutput)>,
    missing: Vec<String>,
    pub calls: RefCell<Vec<String>>,
    pub inputs: RefCell<Vec<(String, String)>>,
    pub spawned: RefCell<Vec<String>>,
    pub sleeps: RefCell<Vec<Duration>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, prefix: &str, output: CommandOutput) -> Self {
        self.responses.push((prefix.to_string(), output));
        self
    }

    /// `exists` answers false for this program
    pub fn missing(mut self, program: &str) -> Self {
        self.missing.push(program.to_string());
        self
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn answer(&self, line: &str) -> CommandOutput {
        self.responses
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_else(|| CommandOutput::ok(""))
    }
}

fn line(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        let line = line(program, args);
        self.calls.borrow_mut().push(line.clone());
        Ok(self.answer(&line))
    }

    fn run_with_input(&self, program: &str, args: &[&str], input: &str) -> io::Result<CommandOutput> {
        let line = line(program, args);
        self.calls.borrow_mut().push(line.clone());
        self.inputs.borrow_mut().push((line.clone(), input.to_string()));
        Ok(self.answer(&line))
    }

    fn spawn_detached(&self, program: &str, args: &[&str]) -> io::Result<()> {
        self.spawned.borrow_mut().push(line(program, args));
        Ok(())
    }

    fn exists(&self, program: &str) -> bool {
        !self.missing.iter().any(|m| m == program)
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }
}

// ============================================================================
// Network
// ============================================================================

pub struct FakeNetwork {
    pub ping_ok: bool,
    pub port_open: bool,
    pub dns_ok: bool,
    pub https_ok: bool,
    pub pings: Cell<usize>,
    pub connects: RefCell<Vec<SocketAddr>>,
}

impl FakeNetwork {
    pub fn online() -> Self {
        Self {
            ping_ok: true,
            port_open: true,
            dns_ok: true,
            https_ok: true,
            pings: Cell::new(0),
            connects: RefCell::new(Vec::new()),
        }
    }

    pub fn port_closed() -> Self {
        Self {
            ping_ok: false,
            port_open: false,
            ..Self::online()
        }
    }

    pub fn probe_count(&self) -> usize {
        self.pings.get() + self.connects.borrow().len()
    }
}

impl NetworkProbe for FakeNetwork {
    fn ping(&self, _ip: IpAddr) -> bool {
        self.pings.set(self.pings.get() + 1);
        self.ping_ok
    }

    fn tcp_connect(&self, addr: SocketAddr, _timeout: Duration) -> bool {
        self.connects.borrow_mut().push(addr);
        self.port_open
    }

    fn resolve(&self, _host: &str) -> bool {
        self.dns_ok
    }

    fn https_reachable(&self, _url: &str) -> bool {
        self.https_ok
    }

    fn fetch_json(&self, _url: &str) -> Result<serde_json::Value, String> {
        Err("not scripted".to_string())
    }
}

// ============================================================================
// Environment
// ============================================================================

pub fn debian_systemd() -> EnvironmentDescriptor {
    EnvironmentDescriptor {
        os_family: OsFamily::Debian,
        os_name: "Debian GNU/Linux 12 (bookworm)".to_string(),
        package_manager: PackageManager::Apt,
        init_system: InitSystem::Systemd,
        architecture: "x86_64".to_string(),
    }
}
