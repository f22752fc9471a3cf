//! Binary entry point for `authorized-keys-agent`, invoked by sshd's
//! `AuthorizedKeysCommand` per connection attempt.
//!
//! `main` never calls `std::process::exit` itself — it delegates to
//! [`run`], whose local bindings (the metadata client, any `ScratchDir`
//! acquired along the way) drop normally as the function returns, and only
//! then does `main` turn the resulting code into the process's actual exit
//! status via `ExitCode`.

use std::process::ExitCode;

use ec2_ssh_key_agent::{agent, cli, config::Config, error::Error, metadata::MetadataClient};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    if let Err(e) = ec2_ssh_key_agent::init_tracing() {
        eprintln!("failed to initialize logging: {e}");
    }

    ExitCode::from(run().await)
}

async fn run() -> u8 {
    let args = match cli::parse_args(std::env::args()) {
        Ok(args) => args,
        Err(e) => {
            e.log();
            return e.exit_code();
        }
    };

    match run_inner(&args).await {
        Ok(key_lines) => {
            for line in key_lines {
                println!("{line}");
            }
            0
        }
        Err(e) => {
            e.log();
            e.exit_code()
        }
    }
}

async fn run_inner(args: &cli::Args) -> Result<Vec<String>, Error> {
    let config = Config::load().map_err(Error::internal)?;
    let metadata = MetadataClient::new(config.metadata_base_url(), config.metadata_timeout())
        .map_err(Error::internal)?;

    agent::run(&config, args, &metadata).await
}
