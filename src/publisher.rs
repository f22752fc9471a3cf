//! `HostKeyPublisher` — the boot-time entry point that publishes the
//! instance's SSH host public keys.
//!
//! Unlike `AuthorizedKeysAgent`, a non-instance diagnosis here is a hard
//! failure: publishing host keys is this process's only purpose, so there
//! is nothing useful left to do once `InstanceGuard` says no.
//!
//! The instance-identity credentials deserialize straight into
//! `SecretString` fields (`secrecy`'s `serde` feature), so the raw access
//! key id, secret access key, and session token never exist as a plain
//! `String` anywhere in this flow; only the non-secret request body passes
//! through the per-invocation [`ScratchDir`].

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::Config;
use crate::error::Error;
use crate::instance_guard;
use crate::metadata::MetadataClient;
use crate::scratch::ScratchDir;
use crate::sigv4::{self, Credentials};

#[derive(Deserialize)]
struct SecurityCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: SecretString,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: SecretString,
    #[serde(rename = "Token")]
    token: SecretString,
}

#[derive(Deserialize)]
struct IdentityDocument {
    #[serde(rename = "accountId")]
    account_id: String,
}

/// Runs the full `HostKeyPublisher` flow: resolve identity, read host
/// public keys, fetch instance-identity credentials, sign, and POST.
pub async fn run(config: &Config, metadata: &MetadataClient) -> Result<(), Error> {
    let identity = instance_guard::resolve(config, metadata)
        .await
        .map_err(|_| Error::NotAnInstance)?;

    let scratch = ScratchDir::create(config.scratch_parent())?;

    let host_keys = read_host_keys(config.host_key_glob())?;

    let raw_credentials: SecurityCredentials = {
        let bytes = metadata
            .fetch("/meta-data/identity-credentials/ec2/security-credentials/ec2-instance/")
            .await?
            .ok_or_else(|| Error::metadata("instance-identity credentials missing"))?;
        serde_json::from_slice(&bytes)?
    };

    let document: IdentityDocument = {
        let bytes = metadata
            .fetch("/dynamic/instance-identity/document")
            .await?
            .ok_or_else(|| Error::metadata("instance-identity document missing"))?;
        serde_json::from_slice(&bytes)?
    };

    let credentials = Credentials {
        access_key_id: raw_credentials.access_key_id,
        secret_access_key: raw_credentials.secret_access_key,
        session_token: raw_credentials.token,
    };

    let host = format!("ec2-instance-connect.{}.{}", identity.region, identity.domain);

    let signed = sigv4::sign_put_host_keys(
        &credentials,
        &host,
        &identity.region,
        &document.account_id,
        &identity.availability_zone,
        &identity.instance_id,
        &host_keys,
    )
    .map_err(Error::internal)?;

    // The request body carries no secret material (it's account id, zone,
    // instance id, and host public keys, all already public on this
    // instance); the `Authorization` and security-token headers, which do,
    // stay in the `SecretString` fields of `signed` and are never written
    // here.
    scratch.write_file("request-body.json", signed.body.as_bytes(), 0o600)?;

    let publish_url = match config.publish_base_url() {
        Some(base) => format!("{base}/PutEC2HostKeys/"),
        None => format!("https://{host}/PutEC2HostKeys/"),
    };

    publish(&publish_url, &host, &signed).await
}

/// Reads every file matching `glob_pattern`, sorted by filename, so the
/// published `HostKeys` array is in lexicographic order.
fn read_host_keys(glob_pattern: &str) -> Result<Vec<String>, Error> {
    let mut paths: Vec<_> = glob::glob(glob_pattern)
        .map_err(|e| Error::internal(eyre::eyre!(e)))?
        .filter_map(Result::ok)
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| std::fs::read_to_string(&path).map_err(Error::from))
        .collect()
}

/// POSTs the signed request to `url`. `host` is sent as an explicit `Host`
/// header rather than left to whatever authority `url` carries, since the
/// SigV4 signature was computed over the *regional* `host` value and must
/// match exactly — in production `url`'s authority already equals `host`,
/// but tests redirect `url` at a mock server while the signature still
/// needs to describe the real endpoint.
async fn publish(url: &str, host: &str, signed: &sigv4::SignedRequest) -> Result<(), Error> {
    let client = reqwest::Client::new();

    let response = client
        .post(url)
        .header("host", host)
        .header("Authorization", signed.authorization.expose_secret())
        .header("Content-Encoding", "amz-1.0")
        .header("Content-Type", "application/json")
        .header("x-amz-content-sha256", &signed.content_sha256)
        .header("x-amz-date", &signed.x_amz_date)
        .header(
            "x-amz-security-token",
            signed.x_amz_security_token.expose_secret(),
        )
        .header(
            "x-amz-target",
            "com.amazon.aws.sshaccessproxyservice.AWSEC2InstanceConnectService.PutEC2HostKeys",
        )
        .body(signed.body.clone())
        .send()
        .await
        .map_err(|e| Error::metadata(format!("PutEC2HostKeys: {e}")))?;

    if !response.status().is_success() {
        return Err(Error::metadata(format!(
            "PutEC2HostKeys: unexpected status {}",
            response.status()
        )));
    }

    Ok(())
}
