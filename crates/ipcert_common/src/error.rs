//! Error types for ipcert.
//!
//! One enum covers every terminal state a component can reach. The CLI maps
//! each variant onto a distinct exit code.

use std::path::PathBuf;

use thiserror::Error;

use crate::backup::BackupKind;
use crate::validation::ValidationError;

#[derive(Error, Debug)]
pub enum IpcertError {
    #[error("Invalid input: {0}")]
    InvalidInput(#[source] ValidationError),

    #[error("{0} is a private or reserved address; the CA only issues for public IPs")]
    PrivateOrReservedAddress(String),

    #[error("Port {port} on {ip} is not reachable (HTTP-01 validation needs it open)")]
    PortUnreachable { ip: String, port: u16 },

    #[error("Unresolved dependencies: {}", .0.join(", "))]
    UnresolvedDependencies(Vec<String>),

    #[error("certbot failed ({0})")]
    ExternalClientFailure(String),

    #[error("Renewal dry-run failed; real renewal was not attempted ({0})")]
    DryRunFailed(String),

    #[error("No scheduling mechanism could be installed: {0}")]
    SchedulerUnavailable(String),

    #[error("Another ipcert operation holds the lock (pid {pid}, {operation})")]
    LockContention { pid: u32, operation: String },

    #[error("Configuration is corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("No {0} backup found")]
    NoBackupFound(BackupKind),

    #[error("Could not detect the host environment")]
    EnvironmentUndetectable,

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("This operation requires root privileges")]
    InsufficientPrivilege,

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IpcertError {
    /// Wrap an IO error together with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IpcertError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the operator can fix this without touching ipcert itself.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            IpcertError::InvalidInput(_)
                | IpcertError::PrivateOrReservedAddress(_)
                | IpcertError::PortUnreachable { .. }
                | IpcertError::UnresolvedDependencies(_)
                | IpcertError::LockContention { .. }
                | IpcertError::InsufficientPrivilege
        )
    }
}

impl From<ValidationError> for IpcertError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Private(addr) => IpcertError::PrivateOrReservedAddress(addr),
            other => IpcertError::InvalidInput(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, IpcertError>;
