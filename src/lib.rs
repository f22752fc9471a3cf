//! Host-side authorization agent for a managed, short-lived SSH key
//! service on cloud virtual machine instances.
//!
//! Two entry points share everything below [`agent`] and [`publisher`]:
//! `AuthorizedKeysAgent`, invoked by sshd per connection to authorize keys
//! for a named local user, and `HostKeyPublisher`, invoked once at boot to
//! publish the instance's own SSH host public keys. Dependency order,
//! leaves first: [`crypto`] and [`metadata`] → [`instance_guard`] →
//! {[`chain_verifier`], [`attested_key`], [`key_authorizer`], [`sigv4`]} →
//! [`agent`] / [`publisher`].

pub mod agent;
pub mod attested_key;
pub mod chain_verifier;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod instance_guard;
pub mod key_authorizer;
pub mod metadata;
pub mod publisher;
pub mod scratch;
pub mod sigv4;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

/// Initializes the process-wide tracing subscriber.
///
/// Both binaries are short-lived, single-invocation processes whose
/// diagnostics land in the system log via stderr, not an HTTP access log —
/// compact single-line formatting, no ANSI color (journald strips it
/// anyway), level controlled by `EC2_SSH_AGENT_LOG` defaulting to `info`.
pub fn init_tracing() -> eyre::Result<()> {
    FmtSubscriber::builder()
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("EC2_SSH_AGENT_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    Ok(())
}
