//! Instance gating and identity resolution.
//!
//! Decides whether the local host is a legitimate instance of the targeted
//! cloud provider and, if so, resolves its instance id, availability zone,
//! region, and service domain. This is the first gate every entry point
//! passes through: an `AuthorizedKeysAgent` invocation on a non-instance
//! host is a silent no-op, while a `HostKeyPublisher` invocation has no
//! other purpose and so fails hard.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::Config;
use crate::error::Error;
use crate::metadata::MetadataClient;

static INSTANCE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^i-[0-9a-f]{8,32}$").expect("valid regex"));

static AVAILABILITY_ZONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z]+-){2,3}[0-9][a-z]$").expect("valid regex"));

/// The resolved identity of the local instance, built fresh on every
/// invocation and discarded on exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub instance_id: String,
    pub availability_zone: String,
    pub region: String,
    pub domain: String,
}

impl InstanceIdentity {
    /// The Common Name the signer chain's leaf certificate is expected to
    /// carry for this instance's region and domain.
    pub fn expected_signer_cn(&self) -> String {
        format!("managed-ssh-signer.{}.{}", self.region, self.domain)
    }
}

/// Resolves whether the local host is a genuine cloud instance, returning
/// its identity if so.
///
/// Returns `Err(Error::NotAnInstance)` when gating fails; callers decide
/// whether that is a silent no-op (`AuthorizedKeysAgent`) or a hard failure
/// (`HostKeyPublisher`) — this function's job is only to make the call.
pub async fn resolve(config: &Config, metadata: &MetadataClient) -> Result<InstanceIdentity, Error> {
    let instance_id = metadata
        .fetch_text("/meta-data/instance-id/")
        .await?
        .ok_or(Error::NotAnInstance)?;

    if !INSTANCE_ID_RE.is_match(&instance_id) {
        return Err(Error::NotAnInstance);
    }

    check_hypervisor(config, &instance_id)?;

    let availability_zone = metadata
        .fetch_text("/meta-data/placement/availability-zone/")
        .await?
        .ok_or(Error::NotAnInstance)?;

    if !AVAILABILITY_ZONE_RE.is_match(&availability_zone) {
        return Err(Error::NotAnInstance);
    }

    let region = derive_region(&availability_zone);

    let domain = metadata
        .fetch_text("/meta-data/services/domain/")
        .await?
        .ok_or(Error::NotAnInstance)?;

    Ok(InstanceIdentity {
        instance_id,
        availability_zone,
        region,
        domain,
    })
}

/// Strips the trailing single lowercase letter (and any trailing path
/// suffix) from an availability zone to derive its region, e.g.
/// `us-east-1a` -> `us-east-1`.
fn derive_region(availability_zone: &str) -> String {
    let zone = availability_zone.split('/').next().unwrap_or(availability_zone);
    zone[..zone.len().saturating_sub(1)].to_string()
}

/// Checks the hypervisor UUID file first, then falls back to the DMI board
/// asset tag, per the specification's priority order. Missing both sources
/// or a mismatch is "not an instance".
fn check_hypervisor(config: &Config, instance_id: &str) -> Result<(), Error> {
    if let Ok(uuid) = std::fs::read(config.hypervisor_uuid_path()) {
        return if uuid.get(..3) == Some(b"ec2") {
            Ok(())
        } else {
            Err(Error::NotAnInstance)
        };
    }

    match std::fs::read_to_string(config.dmi_board_asset_tag_path()) {
        Ok(tag) if tag.trim() == instance_id => Ok(()),
        _ => Err(Error::NotAnInstance),
    }
}
