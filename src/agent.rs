//! `AuthorizedKeysAgent` — the per-connection entry point sshd invokes.
//!
//! Orchestrates the pipeline: InstanceGuard gates the host, the fetcher
//! pulls the user's active-keys blob plus the signer chain and its OCSP
//! staples from the metadata service, ChainVerifier and AttestedKeyParser
//! turn that into candidate records, and KeyAuthorizer decides what to
//! print. Every exit is fail-closed: either the accepted key lines are
//! fully flushed and the process exits 0, or nothing is printed at all.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;

use crate::attested_key;
use crate::chain_verifier::{self, LocalTrustStore, OcspStapleSet, SignerChain};
use crate::cli::Args;
use crate::config::Config;
use crate::error::Error;
use crate::instance_guard;
use crate::key_authorizer;
use crate::metadata::MetadataClient;
use crate::scratch::ScratchDir;

/// Runs the full `AuthorizedKeysAgent` pipeline and returns the accepted
/// key lines to print, in emission order.
///
/// A `Ok(vec![])` return and an `Err` both mean "nothing is emitted"; the
/// distinction only matters for logging and the process exit code, which
/// the caller in `src/bin/authorized_keys_agent.rs` is responsible for.
pub async fn run(config: &Config, args: &Args, metadata: &MetadataClient) -> Result<Vec<String>, Error> {
    if !user_exists_locally(&args.user) {
        return Err(Error::UnknownUser);
    }

    let identity = match instance_guard::resolve(config, metadata).await {
        Ok(identity) => identity,
        Err(Error::NotAnInstance) => return Err(Error::NotAnInstance),
        Err(other) => return Err(other),
    };

    let active_keys_path = format!("/meta-data/managed-ssh-keys/active-keys/{}/", args.user);
    let head_status = metadata.head_status(&active_keys_path).await?;
    if head_status == 404 {
        return Err(Error::NoKeysForUser);
    }

    let blob = metadata
        .fetch(&active_keys_path)
        .await?
        .ok_or(Error::NoKeysForUser)?;

    let scratch = ScratchDir::create(config.scratch_parent())?;

    let signer_chain_pem = metadata
        .fetch("/meta-data/managed-ssh-keys/signer-cert/")
        .await?
        .ok_or_else(|| Error::metadata("signer-cert missing after active-keys hit"))?;
    scratch.write_file("signer-chain.pem", &signer_chain_pem, 0o600)?;

    let staples = fetch_ocsp_staples(metadata, &scratch).await?;

    let chain = SignerChain::parse(&signer_chain_pem)?;
    let trust_store = LocalTrustStore::open(config.trust_store_path())?;
    let validated = chain_verifier::verify(&chain, &trust_store, &identity.expected_signer_cn(), &staples)?;

    let signer_public_key_pem = validated.public_key.public_key_to_pem()?;
    scratch.write_file("signer-public-key.pem", &signer_public_key_pem, 0o400)?;

    let records = attested_key::parse(&blob);
    let attempted = records.len();

    for (i, record) in records.iter().enumerate() {
        if let Some(sig) = record.decode_signature() {
            scratch.write_file(&format!("record-{i}.sig"), &sig, 0o400)?;
        }
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_secs() as i64;

    let accepted = key_authorizer::authorize(
        &records,
        &validated.public_key,
        &identity.instance_id,
        now,
        args.expected_fingerprint.as_deref(),
    );

    if accepted.is_empty() {
        return Err(Error::NoValidKey { attempted });
    }

    for record in &accepted {
        tracing::info!(
            fingerprint = %record.fingerprint,
            caller = record.caller.as_deref().unwrap_or(""),
            request_id = record.request_id.as_deref().unwrap_or(""),
            "accepted key"
        );
    }

    Ok(accepted.into_iter().map(|r| r.key_line).collect())
}

/// Fetches the OCSP staple index and every staple it names, decoding each
/// from base64 into the DER bytes [`OcspStapleSet`] expects and writing a
/// copy of each into `scratch`.
async fn fetch_ocsp_staples(metadata: &MetadataClient, scratch: &ScratchDir) -> Result<OcspStapleSet, Error> {
    let mut staples = OcspStapleSet::new();

    let index = metadata
        .fetch_text("/meta-data/managed-ssh-keys/signer-ocsp/")
        .await?
        .unwrap_or_default();

    for token in index.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let path = format!("/meta-data/managed-ssh-keys/signer-ocsp/{token}");
        let Some(encoded) = metadata.fetch_text(&path).await? else {
            continue;
        };

        let der = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::metadata(format!("malformed OCSP staple {token}: {e}")))?;

        scratch.write_file(&format!("ocsp-{token}.der"), &der, 0o600)?;
        staples.insert(token.to_string(), der);
    }

    Ok(staples)
}

/// Checks whether `user` exists in the local user database.
fn user_exists_locally(user: &str) -> bool {
    let Ok(passwd) = std::fs::read_to_string("/etc/passwd") else {
        return false;
    };

    passwd
        .lines()
        .filter_map(|line| line.split(':').next())
        .any(|name| name == user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_exists_locally_is_false_without_passwd() {
        // Exercised indirectly via scenario tests against a wiremock
        // server; this just confirms the function degrades to "absent"
        // rather than panicking when the file can't be read.
        assert!(!user_exists_locally("definitely-not-a-real-user-xyz"));
    }
}
