//! Exit codes for ipcertctl
//!
//! Every terminal error state gets its own code so wrappers and cron mail
//! can tell a bad argument from a CA failure.

use std::path::Path;

use ipcert_common::logging::ERROR_LOG;
use ipcert_common::IpcertError;

/// Exit code for success
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code for general errors (IO and anything unclassified)
pub const EXIT_GENERAL_ERROR: i32 = 1;

/// Exit code for invalid arguments or rejected input
pub const EXIT_INVALID_ARGUMENTS: i32 = 2;

/// Exit code when a mutating command is run without root
pub const EXIT_INSUFFICIENT_PRIVILEGE: i32 = 3;

/// Exit code when the CA or the target IP cannot be reached
pub const EXIT_NETWORK_FAILURE: i32 = 4;

/// Exit code when certbot fails to issue or renew
pub const EXIT_CERTIFICATE_FAILURE: i32 = 5;

/// Exit code for a corrupt configuration or missing backup
pub const EXIT_CONFIG_FAILURE: i32 = 6;

/// Exit code for missing dependencies or an unusable host
pub const EXIT_DEPENDENCY_FAILURE: i32 = 7;

/// Exit code when another ipcert run holds the lock
pub const EXIT_LOCK_CONTENTION: i32 = 8;

/// 128 + SIGINT
pub const EXIT_INTERRUPTED: i32 = 130;

/// 128 + SIGTERM
pub const EXIT_TERMINATED: i32 = 143;

pub fn exit_code(err: &IpcertError) -> i32 {
    match err {
        IpcertError::InvalidInput(_) | IpcertError::PrivateOrReservedAddress(_) => {
            EXIT_INVALID_ARGUMENTS
        }
        IpcertError::InsufficientPrivilege => EXIT_INSUFFICIENT_PRIVILEGE,
        IpcertError::NetworkUnreachable(_) | IpcertError::PortUnreachable { .. } => {
            EXIT_NETWORK_FAILURE
        }
        IpcertError::ExternalClientFailure(_) | IpcertError::DryRunFailed(_) => {
            EXIT_CERTIFICATE_FAILURE
        }
        IpcertError::ConfigCorrupt(_) | IpcertError::NoBackupFound(_) => EXIT_CONFIG_FAILURE,
        IpcertError::UnresolvedDependencies(_)
        | IpcertError::EnvironmentUndetectable
        | IpcertError::SchedulerUnavailable(_) => EXIT_DEPENDENCY_FAILURE,
        IpcertError::LockContention { .. } => EXIT_LOCK_CONTENTION,
        IpcertError::Io { .. } => EXIT_GENERAL_ERROR,
    }
}

/// Exit code for an `anyhow` error coming out of a command
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<IpcertError>()
        .map(exit_code)
        .unwrap_or(EXIT_GENERAL_ERROR)
}

/// Follow-up line printed under an error
pub fn hint_for(err: &anyhow::Error, log_dir: &Path) -> String {
    match err.downcast_ref::<IpcertError>() {
        Some(e) if e.is_user_correctable() => {
            "Correct the problem above and run the command again".to_string()
        }
        _ => format!("Details are in {}", log_dir.join(ERROR_LOG).display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipcert_common::BackupKind;

    #[test]
    fn test_distinct_codes() {
        let cases = [
            (IpcertError::PrivateOrReservedAddress("10.0.0.1".into()), 2),
            (IpcertError::InsufficientPrivilege, 3),
            (
                IpcertError::PortUnreachable {
                    ip: "198.51.100.7".into(),
                    port: 80,
                },
                4,
            ),
            (IpcertError::ExternalClientFailure("x".into()), 5),
            (IpcertError::NoBackupFound(BackupKind::Config), 6),
            (IpcertError::UnresolvedDependencies(vec!["curl".into()]), 7),
            (
                IpcertError::LockContention {
                    pid: 1,
                    operation: "renew".into(),
                },
                8,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(exit_code(&err), code, "{}", err);
        }
    }

    #[test]
    fn test_hint_depends_on_who_can_fix_it() {
        let log_dir = Path::new("/var/log/ipcert");
        let own = anyhow::Error::new(IpcertError::InsufficientPrivilege);
        assert!(hint_for(&own, log_dir).starts_with("Correct the problem"));

        let external = anyhow::Error::new(IpcertError::ExternalClientFailure("x".into()));
        assert_eq!(
            hint_for(&external, log_dir),
            "Details are in /var/log/ipcert/error.log"
        );
    }

    #[test]
    fn test_anyhow_downcast() {
        let err = anyhow::Error::new(IpcertError::DryRunFailed("x".into()));
        assert_eq!(exit_code_for(&err), EXIT_CERTIFICATE_FAILURE);
        assert_eq!(exit_code_for(&anyhow::anyhow!("plain")), EXIT_GENERAL_ERROR);
    }
}
