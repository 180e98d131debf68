#[cfg(feature = "status-output")]
use std::path::Path;

use async_trait::async_trait;
#[cfg(feature = "status-output")]
use sha2::{Digest, Sha256};
#[cfg(feature = "status-output")]
use tokio::fs::{read, read_dir, try_exists};
#[cfg(feature = "status-output")]
use tracing::debug;

use crate::error::DiscoveryError;

use super::InstanceInfo;
#[cfg(feature = "status-output")]
use super::STATUS_FILE;

/// One-shot lookup of the running instances.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<InstanceInfo>, DiscoveryError>;
}

/// Orders instances by id and checks the ids are exactly `0..N`.
pub fn validate_dense(mut instances: Vec<InstanceInfo>) -> Result<Vec<InstanceInfo>, DiscoveryError> {
    if instances.is_empty() {
        return Err(DiscoveryError::Empty);
    }
    instances.sort_by_key(|i| i.id);
    for (expected, instance) in instances.iter().enumerate() {
        if instance.id != expected {
            return Err(DiscoveryError::NotDense {
                expected,
                found: instance.id,
            });
        }
    }
    Ok(instances)
}

/// Reports whether the instance in `dir` has an add-on that writes the status
/// file. An add-on is recognized by the SHA-256 digest of its jar.
#[cfg(feature = "status-output")]
pub async fn detect_status_output(dir: &Path, digests: &[String]) -> Result<bool, DiscoveryError> {
    if !try_exists(dir.join(STATUS_FILE)).await? {
        return Ok(false);
    }

    let mods = dir.join("mods");
    if !try_exists(&mods).await? {
        return Ok(false);
    }

    let mut entries = read_dir(&mods).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "jar") {
            continue;
        }
        let digest = hex_digest(&read(&path).await?);
        if digests.iter().any(|known| known.eq_ignore_ascii_case(&digest)) {
            debug!(path = %path.display(), "found status output add-on");
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(feature = "status-output")]
fn hex_digest(data: &[u8]) -> String {
    use std::fmt::Write;

    let hash = Sha256::digest(data);
    let mut out = String::with_capacity(hash.len() * 2);
    for byte in hash {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
