//! Applies the per-key acceptance predicate and emits accepted keys.
//!
//! Records are evaluated in input order and every accepted key line is
//! emitted in that same order; the fingerprint filter (when present) is an
//! emission filter applied after the full predicate, never a short-circuit
//! that skips signature verification.

use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};
use openssl::rsa::Padding;
use openssl::sign::{RsaPssSaltlen, Verifier};

use crate::attested_key::AttestedKeyRecord;
use crate::crypto::ssh_fingerprint;

/// The outcome of evaluating one record against the acceptance predicate.
pub struct Accepted {
    pub key_line: String,
    pub fingerprint: String,
    pub caller: Option<String>,
    pub request_id: Option<String>,
}

/// Evaluates every record against the acceptance predicate and returns the
/// accepted ones, in input order, each with its fingerprint and caller
/// metadata ready for the structured log line the caller emits.
pub fn authorize(
    records: &[AttestedKeyRecord],
    signer_public_key: &PKey<Public>,
    local_instance_id: &str,
    now: i64,
    expected_fingerprint: Option<&str>,
) -> Vec<Accepted> {
    records
        .iter()
        .filter_map(|record| evaluate(record, signer_public_key, local_instance_id, now, expected_fingerprint))
        .collect()
}

fn evaluate(
    record: &AttestedKeyRecord,
    signer_public_key: &PKey<Public>,
    local_instance_id: &str,
    now: i64,
    expected_fingerprint: Option<&str>,
) -> Option<Accepted> {
    if record.instance_id.as_deref() != Some(local_instance_id) {
        return None;
    }

    let timestamp = record.timestamp?;
    if timestamp <= now {
        return None;
    }

    let fingerprint = fingerprint_of_key_line(&record.key_line)?;

    let signature = record.decode_signature()?;
    if !verify_signature(signer_public_key, &record.signed_data, &signature) {
        return None;
    }

    // The fingerprint filter is applied last, after the full predicate has
    // already run, so it only ever narrows emission — it never prevents a
    // record from being cryptographically evaluated.
    if let Some(expected) = expected_fingerprint {
        if fingerprint != expected {
            return None;
        }
    }

    Some(Accepted {
        key_line: record.key_line.clone(),
        fingerprint,
        caller: record.caller.clone(),
        request_id: record.request_id.clone(),
    })
}

/// Computes the SSH fingerprint of an `authorized_keys`-format line by
/// decoding its base64 key blob field.
fn fingerprint_of_key_line(key_line: &str) -> Option<String> {
    let blob_field = key_line.split_whitespace().nth(1)?;
    let blob = base64_decode(blob_field)?;
    Some(ssh_fingerprint(&blob))
}

fn base64_decode(s: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s).ok()
}

/// Verifies `signature` over `signed_data` using RSA-PSS with SHA-256 and
/// salt length 32, per the record acceptance invariant.
fn verify_signature(public_key: &PKey<Public>, signed_data: &[u8], signature: &[u8]) -> bool {
    let mut verifier = match Verifier::new(MessageDigest::sha256(), public_key) {
        Ok(v) => v,
        Err(_) => return false,
    };

    if verifier.set_rsa_padding(Padding::PKCS1_PSS).is_err() {
        return false;
    }
    if verifier
        .set_rsa_pss_saltlen(RsaPssSaltlen::custom(32))
        .is_err()
    {
        return false;
    }
    if verifier.update(signed_data).is_err() {
        return false;
    }

    verifier.verify(signature).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attested_key;

    fn record_with(instance_id: &str, timestamp: i64, signature_b64: &str) -> AttestedKeyRecord {
        let blob = format!(
            "#Timestamp={timestamp}\n#Instance={instance_id}\nssh-ed25519 AAAAC3\n{signature_b64}\n"
        );
        attested_key::parse(blob.as_bytes()).remove(0)
    }

    #[test]
    fn rejects_wrong_instance_binding() {
        let record = record_with("i-ffffffffffffffffe", 9999999999, "aGVsbG8=");
        let (_priv_key, pub_key) = rsa_keypair();

        let accepted = authorize(&[record], &pub_key, "i-0123456789abcdef0", 1_700_000_000, None);
        assert!(accepted.is_empty());
    }

    #[test]
    fn rejects_expired_record() {
        let record = record_with("i-0123456789abcdef0", 1, "aGVsbG8=");
        let (_priv_key, pub_key) = rsa_keypair();

        let accepted = authorize(&[record], &pub_key, "i-0123456789abcdef0", 1_700_000_000, None);
        assert!(accepted.is_empty());
    }

    #[test]
    fn rejects_record_with_undecodable_signature() {
        let record = record_with("i-0123456789abcdef0", 9999999999, "not-valid-base64!!");
        let (_priv_key, pub_key) = rsa_keypair();

        let accepted = authorize(&[record], &pub_key, "i-0123456789abcdef0", 1_700_000_000, None);
        assert!(accepted.is_empty());
    }

    fn rsa_keypair() -> (PKey<openssl::pkey::Private>, PKey<Public>) {
        let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
        let priv_key = PKey::from_rsa(rsa).unwrap();
        let public_pem = priv_key.public_key_to_pem().unwrap();
        let pub_key = PKey::public_key_from_pem(&public_pem).unwrap();
        (priv_key, pub_key)
    }
}
