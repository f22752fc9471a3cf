//! Cryptographic utilities shared across the pipeline.
//!
//! Provides the small set of hashing and encoding primitives the rest of
//! the crate builds on: SHA-256 digests, the standard SSH key fingerprint
//! format, and random token generation for scratch directory names.

use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Computes the SHA-256 hash of data and returns it as a hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes the SHA-1 hash of data and returns it as lowercase hex, the
/// fingerprint format the chain verifier uses to key OCSP staples.
pub fn sha1_hex(data: &[u8]) -> String {
    use openssl::hash::{hash, MessageDigest};
    let digest = hash(MessageDigest::sha1(), data).expect("sha1 is always available");
    hex::encode(digest)
}

/// Computes the standard SSH public-key fingerprint: `SHA256:` followed by
/// the unpadded standard-base64 encoding of the SHA-256 digest of the
/// decoded key blob (RFC 4716 wire format, not the `authorized_keys` text).
pub fn ssh_fingerprint(key_blob: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_blob);
    let digest = hasher.finalize();
    format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    )
}

/// Generates a random token of `N` bytes, encoded in base58.
///
/// Used to name the per-invocation scratch directory: short, filesystem
/// safe, and free of characters that could be mistaken for path
/// separators or shell metacharacters.
pub fn generate_token<const N: usize>(mut rng: impl Rng) -> eyre::Result<String> {
    let mut token = [0u8; N];
    rng.try_fill_bytes(&mut token)?;
    Ok(bs58::encode(token).into_string())
}
