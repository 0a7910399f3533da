//! Web server detection for the challenge step

use tracing::{debug, info};

use crate::config::WebServerPreference;
use crate::environment::{EnvironmentDescriptor, InitSystem};
use crate::exec::{run_lenient, CommandRunner};
use crate::report::RunReport;
use crate::validation::SafePath;

use super::certbot::Authenticator;

/// A server ipcert knows how to cooperate with
struct KnownServer {
    name: &'static str,
    services: &'static [&'static str],
    processes: &'static [&'static str],
}

const KNOWN_SERVERS: &[KnownServer] = &[
    KnownServer {
        name: "nginx",
        services: &["nginx"],
        processes: &["nginx"],
    },
    KnownServer {
        name: "apache",
        services: &["apache2", "httpd", "apache24"],
        processes: &["apache2", "httpd"],
    },
];

/// Whether the init system reports `service` as running
fn service_active(env: &EnvironmentDescriptor, runner: &dyn CommandRunner, service: &str) -> bool {
    match env.init_system {
        InitSystem::Systemd => {
            run_lenient(runner, "systemctl", &["is-active", "--quiet", service]).success()
        }
        InitSystem::OpenRc => run_lenient(runner, "rc-service", &[service, "status"]).success(),
        InitSystem::SysV => run_lenient(runner, "service", &[service, "status"]).success(),
        InitSystem::BsdRc => run_lenient(runner, "service", &[service, "onestatus"]).success(),
        InitSystem::Launchd => {
            let out = run_lenient(runner, "launchctl", &["list"]);
            out.success() && out.stdout.lines().any(|l| l.contains(service))
        }
        InitSystem::Unknown => false,
    }
}

fn process_running(runner: &dyn CommandRunner, process: &str) -> bool {
    run_lenient(runner, "pgrep", &["-x", process]).success()
}

/// Name of the first known server found running
pub fn detect_running_server(
    env: &EnvironmentDescriptor,
    runner: &dyn CommandRunner,
) -> Option<&'static str> {
    for server in KNOWN_SERVERS {
        if server
            .services
            .iter()
            .any(|svc| service_active(env, runner, svc))
        {
            debug!("{} found via {}", server.name, env.init_system);
            return Some(server.name);
        }
    }
    // Universal fallback: look at the process table
    KNOWN_SERVERS
        .iter()
        .find(|server| server.processes.iter().any(|p| process_running(runner, p)))
        .map(|server| {
            debug!("{} found via pgrep", server.name);
            server.name
        })
}

/// Decide how certbot should answer the challenge.
///
/// An explicit preference is used verbatim; `auto` looks for a running
/// nginx or apache and otherwise falls back to standalone.
pub fn select_authenticator(
    preference: WebServerPreference,
    webroot: &SafePath,
    env: &EnvironmentDescriptor,
    runner: &dyn CommandRunner,
    report: &mut RunReport,
) -> Authenticator {
    let explicit = match preference {
        WebServerPreference::Nginx => Some("nginx"),
        WebServerPreference::Apache => Some("apache"),
        WebServerPreference::Standalone => return Authenticator::Standalone,
        WebServerPreference::Auto => None,
    };

    let running = detect_running_server(env, runner);

    let authenticator = match (explicit, running) {
        (Some(wanted), running) => {
            if running != Some(wanted) {
                report.warn(format!(
                    "Configured web server '{}' does not appear to be running; using it anyway",
                    wanted
                ));
            }
            Authenticator::Webroot {
                server: wanted,
                webroot: webroot.clone(),
            }
        }
        (None, Some(found)) => Authenticator::Webroot {
            server: found,
            webroot: webroot.clone(),
        },
        (None, None) => Authenticator::Standalone,
    };
    info!("Challenge authenticator: {}", authenticator.describe());
    authenticator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{OsFamily, PackageManager};
    use crate::exec::CommandOutput;
    use crate::validation::{validate_path, PathPolicy};
    use std::io;

    /// Succeeds only for the listed command lines
    struct Answers(Vec<&'static str>);

    impl CommandRunner for Answers {
        fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
            let line = format!("{} {}", program, args.join(" "));
            if self.0.contains(&line.as_str()) {
                Ok(CommandOutput::ok(""))
            } else {
                Ok(CommandOutput::failed(3, "inactive"))
            }
        }
        fn run_with_input(&self, p: &str, a: &[&str], _: &str) -> io::Result<CommandOutput> {
            self.run(p, a)
        }
        fn spawn_detached(&self, _: &str, _: &[&str]) -> io::Result<()> {
            Ok(())
        }
        fn exists(&self, _: &str) -> bool {
            true
        }
    }

    fn env(init: InitSystem) -> EnvironmentDescriptor {
        EnvironmentDescriptor {
            os_family: OsFamily::Debian,
            os_name: "Debian".into(),
            package_manager: PackageManager::Apt,
            init_system: init,
            architecture: "x86_64".into(),
        }
    }

    fn webroot() -> SafePath {
        validate_path("/var/www/html", PathPolicy::SystemAbsolute).unwrap()
    }

    #[test]
    fn test_systemd_detects_nginx() {
        let runner = Answers(vec!["systemctl is-active --quiet nginx"]);
        let mut report = RunReport::new();
        let auth = select_authenticator(
            WebServerPreference::Auto,
            &webroot(),
            &env(InitSystem::Systemd),
            &runner,
            &mut report,
        );
        assert!(matches!(auth, Authenticator::Webroot { server: "nginx", .. }));
    }

    #[test]
    fn test_pgrep_fallback_finds_apache() {
        let runner = Answers(vec!["pgrep -x httpd"]);
        assert_eq!(
            detect_running_server(&env(InitSystem::OpenRc), &runner),
            Some("apache")
        );
    }

    #[test]
    fn test_nothing_running_means_standalone() {
        let runner = Answers(vec![]);
        let mut report = RunReport::new();
        let auth = select_authenticator(
            WebServerPreference::Auto,
            &webroot(),
            &env(InitSystem::Systemd),
            &runner,
            &mut report,
        );
        assert_eq!(auth, Authenticator::Standalone);
        assert!(report.is_clean());
    }

    #[test]
    fn test_explicit_preference_used_verbatim() {
        let runner = Answers(vec!["systemctl is-active --quiet nginx"]);
        let mut report = RunReport::new();
        let auth = select_authenticator(
            WebServerPreference::Apache,
            &webroot(),
            &env(InitSystem::Systemd),
            &runner,
            &mut report,
        );
        assert!(matches!(auth, Authenticator::Webroot { server: "apache", .. }));
        assert_eq!(report.warning_count(), 1);

        let auth = select_authenticator(
            WebServerPreference::Standalone,
            &webroot(),
            &env(InitSystem::Systemd),
            &runner,
            &mut report,
        );
        assert_eq!(auth, Authenticator::Standalone);
    }
}
