//! HTTP-01 challenge directory preparation

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{IpcertError, Result};
use crate::exec::CommandRunner;
use crate::validation::SafePath;

pub const CHALLENGE_SUBPATH: &str = ".well-known/acme-challenge";

/// Readable by the web server, writable only by root
pub const CHALLENGE_DIR_MODE: u32 = 0o755;

/// Seconds before the probe token removes itself
pub const PROBE_TTL_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeProbe {
    pub dir: PathBuf,
    pub token_path: PathBuf,
    pub token: String,
}

/// Create `<webroot>/.well-known/acme-challenge`, drop a probe token in it
/// and schedule the token's removal.
pub fn prepare_challenge(webroot: &SafePath, runner: &dyn CommandRunner) -> Result<ChallengeProbe> {
    let well_known = webroot.path().join(".well-known");
    let dir = webroot.path().join(CHALLENGE_SUBPATH);
    fs::create_dir_all(&dir).map_err(|e| IpcertError::io(&dir, e))?;
    for path in [&well_known, &dir] {
        fs::set_permissions(path, fs::Permissions::from_mode(CHALLENGE_DIR_MODE))
            .map_err(|e| IpcertError::io(path, e))?;
    }

    let token = Uuid::new_v4().simple().to_string();
    let token_path = dir.join(format!("ipcert-probe-{}", token));
    fs::write(&token_path, &token).map_err(|e| IpcertError::io(&token_path, e))?;
    fs::set_permissions(&token_path, fs::Permissions::from_mode(0o644))
        .map_err(|e| IpcertError::io(&token_path, e))?;
    info!("Challenge directory ready at {}", dir.display());

    let ttl = PROBE_TTL_SECS.to_string();
    let token_arg = token_path.to_string_lossy().to_string();
    if let Err(e) = runner.spawn_detached(
        "sh",
        &[
            "-c",
            "sleep \"$1\"; rm -f -- \"$2\"",
            "ipcert-probe-cleanup",
            &ttl,
            &token_arg,
        ],
    ) {
        debug!("probe cleanup could not be scheduled: {}", e);
    }

    Ok(ChallengeProbe {
        dir,
        token_path,
        token,
    })
}
