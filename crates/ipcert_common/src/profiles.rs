//! ACME profile discovery from the CA directory

use serde_json::Value;
use tracing::info;

use crate::error::{IpcertError, Result};
use crate::net::NetworkProbe;
use crate::orchestrator::certbot::{REQUIRED_PROFILE, STAGING_DIRECTORY};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcmeProfile {
    pub name: String,
    pub description: String,
}

/// Profiles advertised under `meta.profiles`, sorted by name
pub fn parse_profiles(directory: &Value) -> Vec<AcmeProfile> {
    let mut profiles: Vec<AcmeProfile> = directory
        .get("meta")
        .and_then(|m| m.get("profiles"))
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(name, desc)| AcmeProfile {
                    name: name.clone(),
                    description: desc.as_str().unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    profiles.sort_by(|a, b| a.name.cmp(&b.name));
    profiles
}

pub fn fetch_profiles(net: &dyn NetworkProbe) -> Result<Vec<AcmeProfile>> {
    let directory = net
        .fetch_json(STAGING_DIRECTORY)
        .map_err(|e| IpcertError::NetworkUnreachable(format!("{}: {}", STAGING_DIRECTORY, e)))?;
    let profiles = parse_profiles(&directory);
    info!("CA advertises {} profile(s)", profiles.len());
    Ok(profiles)
}

pub fn has_required_profile(profiles: &[AcmeProfile]) -> bool {
    profiles.iter().any(|p| p.name == REQUIRED_PROFILE)
}
