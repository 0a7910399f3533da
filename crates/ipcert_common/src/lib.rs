//! ipcert Common - components for short-lived IP address certificates.
//!
//! Everything that touches the host goes through `exec::CommandRunner` or
//! `net::NetworkProbe`, and every fixed path through `paths::Layout`.

pub mod backup;
pub mod config;
pub mod dependencies;
pub mod environment;
pub mod error;
pub mod exec;
pub mod lock;
pub mod logging;
pub mod net;
pub mod orchestrator;
pub mod paths;
pub mod profiles;
pub mod recovery;
pub mod report;
pub mod scheduler;
pub mod validation;

pub use backup::{BackupKind, BackupManager, BackupRecord};
pub use config::{Config, ConfigStore, KeySize, WebServerPreference};
pub use environment::{EnvironmentDescriptor, EnvironmentProfiler, InitSystem, OsFamily};
pub use error::{IpcertError, Result};
pub use exec::{CommandOutput, CommandRunner, SystemRunner};
pub use lock::{LockOptions, ProcessLock};
pub use net::{NetworkProbe, SystemNetwork};
pub use orchestrator::{CertificateOrchestrator, OrchestratorState, RawRequest};
pub use paths::Layout;
pub use report::RunReport;
