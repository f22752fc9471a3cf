//! Configuration management for the SSH key agent.
//!
//! Handles loading and accessing configuration values from environment
//! variables with fallback to default values. Everything here is an
//! operational knob layered over the otherwise-fixed metadata endpoints and
//! filesystem paths named by the specification; it exists so the binaries
//! are testable against a mock metadata service and so a deployment can
//! relocate the trust store or scratch filesystem without a rebuild.

use std::time::Duration;

use serde::Deserialize;

/// Default configuration values used when not specified in the environment.
pub mod defaults {
    pub const METADATA_BASE_URL: &str = "http://169.254.169.254/latest";
    pub const METADATA_TIMEOUT_SECS: u64 = 1;
    pub const TRUST_STORE_PATH: &str = "/etc/ssh/managed-ssh-trust";
    pub const HOST_KEY_GLOB: &str = "/etc/ssh/*.pub";
    pub const SCRATCH_PARENT: &str = "/dev/shm";
    pub const HYPERVISOR_UUID_PATH: &str = "/sys/hypervisor/uuid";
    pub const DMI_BOARD_ASSET_TAG_PATH: &str = "/sys/devices/virtual/dmi/id/board_asset_tag";
}

#[derive(Clone, Debug, Deserialize)]
/// Agent configuration loaded from environment variables.
///
/// All fields are optional and fall back to values in the `defaults`
/// module. Environment variables are prefixed with `EC2_SSH_AGENT_` when
/// loading.
///
/// # Environment Variables
/// * `EC2_SSH_AGENT_METADATA_BASE_URL`      - Metadata service base URL
/// * `EC2_SSH_AGENT_METADATA_TIMEOUT_SECS`  - Per-request metadata timeout
/// * `EC2_SSH_AGENT_TRUST_STORE_PATH`       - Local trust store path (dir or bundle)
/// * `EC2_SSH_AGENT_HOST_KEY_GLOB`          - Glob for SSH host public keys
/// * `EC2_SSH_AGENT_SCRATCH_PARENT`         - Parent directory for the per-invocation scratch dir
/// * `EC2_SSH_AGENT_HYPERVISOR_UUID_PATH`   - Override for the hypervisor UUID probe file
/// * `EC2_SSH_AGENT_DMI_BOARD_ASSET_TAG_PATH` - Override for the DMI board asset tag probe file
/// * `EC2_SSH_AGENT_PUBLISH_BASE_URL`       - Override for `HostKeyPublisher`'s POST target
pub struct Config {
    metadata_base_url: Option<String>,
    metadata_timeout_secs: Option<u64>,
    trust_store_path: Option<String>,
    host_key_glob: Option<String>,
    scratch_parent: Option<String>,
    hypervisor_uuid_path: Option<String>,
    dmi_board_asset_tag_path: Option<String>,
    publish_base_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metadata_base_url: None,
            metadata_timeout_secs: None,
            trust_store_path: None,
            host_key_glob: None,
            scratch_parent: None,
            hypervisor_uuid_path: None,
            dmi_board_asset_tag_path: None,
            publish_base_url: None,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Reads variables prefixed with `EC2_SSH_AGENT_` and constructs a
    /// `Config` instance. Falls back to default values for any unspecified
    /// setting.
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("EC2_SSH_AGENT_").from_env::<Self>()?)
    }

    /// Gets the configured metadata service base URL.
    pub fn metadata_base_url(&self) -> &str {
        self.metadata_base_url
            .as_deref()
            .unwrap_or(defaults::METADATA_BASE_URL)
    }

    /// Gets the per-request metadata fetch timeout.
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(
            self.metadata_timeout_secs
                .unwrap_or(defaults::METADATA_TIMEOUT_SECS),
        )
    }

    /// Gets the local trust store path (a directory of hashed PEM files or
    /// a single concatenated bundle file).
    pub fn trust_store_path(&self) -> &str {
        self.trust_store_path
            .as_deref()
            .unwrap_or(defaults::TRUST_STORE_PATH)
    }

    /// Gets the glob used to discover SSH host public keys.
    pub fn host_key_glob(&self) -> &str {
        self.host_key_glob
            .as_deref()
            .unwrap_or(defaults::HOST_KEY_GLOB)
    }

    /// Gets the parent directory under which the per-invocation scratch
    /// directory is created. Should be a memory-backed filesystem.
    pub fn scratch_parent(&self) -> &str {
        self.scratch_parent
            .as_deref()
            .unwrap_or(defaults::SCRATCH_PARENT)
    }

    /// Gets the path to the hypervisor UUID probe file.
    pub fn hypervisor_uuid_path(&self) -> &str {
        self.hypervisor_uuid_path
            .as_deref()
            .unwrap_or(defaults::HYPERVISOR_UUID_PATH)
    }

    /// Gets the path to the DMI board asset tag probe file.
    pub fn dmi_board_asset_tag_path(&self) -> &str {
        self.dmi_board_asset_tag_path
            .as_deref()
            .unwrap_or(defaults::DMI_BOARD_ASSET_TAG_PATH)
    }

    /// Gets the override base URL `HostKeyPublisher` should POST
    /// `PutEC2HostKeys` to instead of the regional
    /// `https://ec2-instance-connect.<region>.<domain>` endpoint. `None` in
    /// production; set by tests to redirect the publish call at a mock
    /// server.
    pub fn publish_base_url(&self) -> Option<&str> {
        self.publish_base_url.as_deref()
    }

    /// Overrides the hypervisor UUID probe path. Used by tests to point the
    /// guard at a fixture file instead of `/sys/hypervisor/uuid`.
    pub fn with_hypervisor_uuid_path(mut self, path: impl Into<String>) -> Self {
        self.hypervisor_uuid_path = Some(path.into());
        self
    }

    /// Overrides the DMI board asset tag probe path. Used by tests to point
    /// the guard at a fixture file.
    pub fn with_dmi_board_asset_tag_path(mut self, path: impl Into<String>) -> Self {
        self.dmi_board_asset_tag_path = Some(path.into());
        self
    }

    /// Overrides the metadata service base URL. Used by tests to point the
    /// agent at a mock server.
    pub fn with_metadata_base_url(mut self, url: impl Into<String>) -> Self {
        self.metadata_base_url = Some(url.into());
        self
    }

    /// Overrides the local trust store path.
    pub fn with_trust_store_path(mut self, path: impl Into<String>) -> Self {
        self.trust_store_path = Some(path.into());
        self
    }

    /// Overrides the SSH host public key glob.
    pub fn with_host_key_glob(mut self, glob: impl Into<String>) -> Self {
        self.host_key_glob = Some(glob.into());
        self
    }

    /// Overrides the scratch directory parent.
    pub fn with_scratch_parent(mut self, path: impl Into<String>) -> Self {
        self.scratch_parent = Some(path.into());
        self
    }

    /// Overrides `HostKeyPublisher`'s POST target. Used by tests to redirect
    /// the publish call at a `wiremock` server instead of the real regional
    /// endpoint.
    pub fn with_publish_base_url(mut self, url: impl Into<String>) -> Self {
        self.publish_base_url = Some(url.into());
        self
    }
}
