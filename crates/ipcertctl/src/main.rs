//! ipcertctl - short-lived certificates for public IP addresses
//!
//! The command runs on a blocking thread while the runtime watches for
//! SIGINT/SIGTERM, so an interrupted run still releases the host lock.

use std::path::PathBuf;

use clap::{CommandFactory, Parser};
use ipcert_common::config::ConfigStore;
use ipcert_common::paths::Layout;
use ipcert_common::{lock, logging};
use ipcertctl::cli::{Cli, Command};
use ipcertctl::commands::{self, Context, VERSION};
use ipcertctl::errors::{
    exit_code_for, hint_for, EXIT_GENERAL_ERROR, EXIT_INTERRUPTED, EXIT_SUCCESS, EXIT_TERMINATED,
};
use ipcertctl::output::{display_error, display_info};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// Where renewal jobs point when the running binary cannot be resolved
const DEFAULT_EXE: &str = "/usr/local/bin/ipcertctl";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let action = cli.action();

    if action == Command::Help {
        let _ = Cli::command().print_help();
        println!();
        return;
    }

    let layout = Layout::system();
    let config_path = cli.config.clone().unwrap_or_else(|| layout.config_file());
    // A corrupt config is reported by the command itself; log with defaults meanwhile
    let log_config = ConfigStore::new(&config_path)
        .load()
        .map(|c| c.logging)
        .unwrap_or_default();
    logging::init(&log_config, &layout.log_dir(), cli.debug);
    info!("ipcertctl {} {:?}", VERSION, action);

    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from(DEFAULT_EXE));
    let lock_file = layout.lock_file();
    let log_dir = layout.log_dir();
    let task = tokio::task::spawn_blocking(move || {
        let ctx = Context::new(layout, Some(config_path), exe);
        commands::run(&action, &ctx)
    });

    let code = tokio::select! {
        joined = task => match joined {
            Ok(Ok(())) => EXIT_SUCCESS,
            Ok(Err(e)) => {
                error!("{:#}", e);
                display_error(&format!("{:#}", e));
                display_info(&hint_for(&e, &log_dir));
                exit_code_for(&e)
            }
            Err(e) => {
                error!("command task failed: {}", e);
                display_error("Internal error; see the error log");
                EXIT_GENERAL_ERROR
            }
        },
        code = interrupted() => {
            lock::release_if_owned(&lock_file);
            warn!(target: "audit", "interrupted by signal, exiting with {}", code);
            display_error("Interrupted");
            code
        }
    };

    std::process::exit(code);
}

/// Resolves with the exit code for the first SIGINT or SIGTERM
async fn interrupted() -> i32 {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            return match tokio::signal::ctrl_c().await {
                Ok(()) => EXIT_INTERRUPTED,
                Err(_) => std::future::pending().await,
            };
        }
    };
    tokio::select! {
        Ok(()) = tokio::signal::ctrl_c() => EXIT_INTERRUPTED,
        Some(()) = term.recv() => EXIT_TERMINATED,
        else => std::future::pending().await,
    }
}
