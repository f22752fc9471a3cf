//! Binary entry point for `host-key-publisher`, invoked once at boot to
//! publish the instance's SSH host public keys.
//!
//! Unlike the authorized-keys agent, there is no silent no-op path here:
//! a non-instance diagnosis is this binary's only failure mode that isn't
//! also its only possible outcome, so it's a hard 255 exit.

use std::process::ExitCode;

use ec2_ssh_key_agent::{config::Config, error::Error, metadata::MetadataClient, publisher};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    if let Err(e) = ec2_ssh_key_agent::init_tracing() {
        eprintln!("failed to initialize logging: {e}");
    }

    ExitCode::from(run().await)
}

async fn run() -> u8 {
    match run_inner().await {
        Ok(()) => 0,
        // `Error::exit_code` maps `NotAnInstance` to 0, the right answer
        // for the authorized-keys agent's silent-fallthrough semantics.
        // The publisher has no fallthrough to give sshd: a non-instance
        // diagnosis here is simply a hard failure.
        Err(e @ Error::NotAnInstance) => {
            e.log();
            255
        }
        Err(e) => {
            e.log();
            e.exit_code()
        }
    }
}

async fn run_inner() -> Result<(), Error> {
    let config = Config::load().map_err(Error::internal)?;
    let metadata = MetadataClient::new(config.metadata_base_url(), config.metadata_timeout())
        .map_err(Error::internal)?;

    publisher::run(&config, &metadata).await
}
