//! Dependency Resolver scenarios

mod common;

use common::{debian_systemd, FakeNetwork, FakeRunner};
use ipcert_common::dependencies::{DependencyResolver, INSTALL_ATTEMPTS, INSTALL_RETRY_DELAY};
use ipcert_common::error::IpcertError;
use ipcert_common::exec::CommandOutput;
use ipcert_common::paths::Layout;
use ipcert_common::report::RunReport;
use tempfile::TempDir;

const APT_INSTALL: &str = "env DEBIAN_FRONTEND=noninteractive apt-get install -y";

fn no_dns_tools() -> FakeRunner {
    FakeRunner::new()
        .missing("dig")
        .missing("host")
        .missing("nslookup")
}

#[test]
fn test_three_failed_installs_then_give_up() {
    let temp = TempDir::new().unwrap();
    let layout = Layout::with_root(temp.path());
    let env = debian_systemd();
    let runner = no_dns_tools().respond(APT_INSTALL, CommandOutput::failed(100, "Could not get lock"));
    let net = FakeNetwork::online();
    let mut report = RunReport::new();

    let err = DependencyResolver::new(&env, &layout, &runner, &net)
        .ensure_dependencies(&mut report)
        .unwrap_err();

    match err {
        IpcertError::UnresolvedDependencies(missing) => {
            assert_eq!(missing, vec!["dns-tools".to_string()])
        }
        other => panic!("expected UnresolvedDependencies, got {:?}", other),
    }

    let installs = runner.calls_starting_with(APT_INSTALL);
    assert_eq!(installs.len(), INSTALL_ATTEMPTS as usize);
    assert!(installs.iter().all(|c| c.ends_with(" dnsutils")));
    assert_eq!(
        *runner.sleeps.borrow(),
        vec![INSTALL_RETRY_DELAY; INSTALL_ATTEMPTS as usize - 1]
    );
    // Index refreshed once, not per attempt
    assert_eq!(runner.calls_starting_with("apt-get update").len(), 1);
    assert!(report
        .suggestions()
        .iter()
        .any(|s| s.contains("apt-get install -y dnsutils")));
}

#[test]
fn test_offline_host_fails_before_installing() {
    let temp = TempDir::new().unwrap();
    let layout = Layout::with_root(temp.path());
    let env = debian_systemd();
    let runner = no_dns_tools();
    let net = FakeNetwork {
        dns_ok: false,
        ..FakeNetwork::online()
    };
    let mut report = RunReport::new();

    let err = DependencyResolver::new(&env, &layout, &runner, &net)
        .ensure_dependencies(&mut report)
        .unwrap_err();

    assert!(matches!(err, IpcertError::NetworkUnreachable(_)));
    assert!(runner.calls.borrow().is_empty());
}

#[test]
fn test_broken_tool_is_reinstalled_and_rechecked() {
    let temp = TempDir::new().unwrap();
    let layout = Layout::with_root(temp.path());
    let env = debian_systemd();
    // curl exists but its self-test keeps failing
    let runner = FakeRunner::new().respond("curl --version", CommandOutput::failed(127, "libcurl missing"));
    let net = FakeNetwork::online();
    let mut report = RunReport::new();

    let err = DependencyResolver::new(&env, &layout, &runner, &net)
        .ensure_dependencies(&mut report)
        .unwrap_err();

    assert!(matches!(err, IpcertError::UnresolvedDependencies(ref m) if m == &vec!["curl".to_string()]));
    assert_eq!(runner.calls_starting_with(APT_INSTALL).len(), 1);
    assert!(runner.sleeps.borrow().is_empty());
}

#[test]
fn test_everything_present_installs_nothing() {
    let temp = TempDir::new().unwrap();
    let layout = Layout::with_root(temp.path());
    let env = debian_systemd();
    let runner = FakeRunner::new();
    let net = FakeNetwork::online();
    let mut report = RunReport::new();

    let installed = DependencyResolver::new(&env, &layout, &runner, &net)
        .ensure_dependencies(&mut report)
        .unwrap();

    assert!(installed.is_empty());
    assert!(runner.calls_starting_with(APT_INSTALL).is_empty());
}

#[test]
fn test_old_certbot_falls_back_to_venv() {
    let temp = TempDir::new().unwrap();
    let layout = Layout::with_root(temp.path());
    let env = debian_systemd();
    let runner = FakeRunner::new().respond("certbot --version", CommandOutput::ok("certbot 2.1.0"));
    let net = FakeNetwork::online();
    let mut report = RunReport::new();

    // The link dangles in the sandbox, so PATH certbot 2.1.0 is found again
    let venv_bin = layout.certbot_venv_dir().join("bin/certbot");
    let err = DependencyResolver::new(&env, &layout, &runner, &net)
        .ensure_certificate_client(&mut report)
        .unwrap_err();

    assert!(matches!(err, IpcertError::UnresolvedDependencies(_)));
    assert_eq!(runner.calls_starting_with("python3 -m venv").len(), 1);
    assert_eq!(
        std::fs::read_link(layout.certbot_link()).unwrap(),
        venv_bin
    );
    assert_eq!(report.warning_count(), 1);
}
