//! Signer certificate chain and OCSP staple validation.
//!
//! The signer chain is only honored once its leaf's Common Name matches the
//! region/domain the instance resolved, the chain builds to a locally
//! trusted root under strict X.509 path validation, and every
//! not-yet-implicitly-trusted certificate in the chain carries a `good`
//! OCSP staple signed by its issuer. All three checks must pass before the
//! leaf's public key is released to the rest of the pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::ocsp::{OcspCertId, OcspCertStatus, OcspResponse};
use openssl::pkey::{PKey, Public};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509StoreContext, X509};

use crate::crypto::sha1_hex;
use crate::error::Error;

/// An ordered signer certificate chain: leaf first, chain-provided root
/// candidate last.
pub struct SignerChain {
    certs: Vec<X509>,
}

impl SignerChain {
    /// Splits a concatenated PEM blob into an ordered chain. OpenSSL's PEM
    /// parser already preserves on-wire order, so no manual splitting is
    /// needed beyond this single call.
    pub fn parse(pem: &[u8]) -> Result<Self, Error> {
        let certs = X509::stack_from_pem(pem)
            .map_err(|e| Error::trust(format!("malformed signer chain: {e}")))?;

        if certs.is_empty() {
            return Err(Error::trust("signer chain is empty"));
        }

        Ok(Self { certs })
    }

    pub fn leaf(&self) -> &X509 {
        &self.certs[0]
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

/// Maps the lowercase hex SHA-1 fingerprint of a chain certificate to its
/// DER-encoded OCSP response bytes.
#[derive(Default)]
pub struct OcspStapleSet {
    staples: HashMap<String, Vec<u8>>,
}

impl OcspStapleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fingerprint: impl Into<String>, der: Vec<u8>) {
        self.staples.insert(fingerprint.into(), der);
    }

    fn get(&self, fingerprint: &str) -> Option<&[u8]> {
        self.staples.get(fingerprint).map(Vec::as_slice)
    }
}

/// The local trust store, addressed either as a directory of hashed PEM
/// files (OpenSSL's `c_rehash` convention) or as a single concatenated
/// bundle file with subject-CN comment lines preceding each certificate.
pub enum LocalTrustStore {
    Directory(PathBuf),
    Bundle(PathBuf),
}

impl LocalTrustStore {
    /// Opens the trust store at `path`, inferring its shape from whether
    /// the path is a directory or a regular file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if path.is_dir() {
            Ok(Self::Directory(path.to_path_buf()))
        } else {
            Ok(Self::Bundle(path.to_path_buf()))
        }
    }

    /// Looks up the trust-store's copy of a certificate by subject,
    /// returning `None` if no entry exists for that subject at all (not
    /// merely that it disagrees with `cert`).
    fn lookup_by_subject(&self, subject_hash: u32, cn: Option<&str>) -> Result<Option<X509>, Error> {
        match self {
            Self::Directory(dir) => {
                let file_name = format!("{subject_hash:08x}.0");
                match std::fs::read(dir.join(&file_name)) {
                    Ok(pem) => Ok(Some(X509::from_pem(&pem)?)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(Error::internal(e)),
                }
            }
            Self::Bundle(bundle_path) => {
                let Some(cn) = cn else { return Ok(None) };
                let contents = std::fs::read_to_string(bundle_path)?;
                Self::find_block_by_comment(&contents, cn)
            }
        }
    }

    /// Scans a bundle file for the PEM block whose preceding `#`-comment
    /// line matches `cn` exactly, returning the parsed certificate between
    /// `BEGIN CERTIFICATE` and the following `END CERTIFICATE` marker.
    fn find_block_by_comment(contents: &str, cn: &str) -> Result<Option<X509>, Error> {
        let mut last_comment: Option<&str> = None;
        let mut lines = contents.lines().peekable();

        while let Some(line) = lines.next() {
            let trimmed = line.trim();
            if let Some(comment) = trimmed.strip_prefix('#') {
                last_comment = Some(comment.trim());
                continue;
            }

            if trimmed == "-----BEGIN CERTIFICATE-----" && last_comment == Some(cn) {
                let mut block = String::from(line);
                block.push('\n');
                for inner in lines.by_ref() {
                    block.push_str(inner);
                    block.push('\n');
                    if inner.trim() == "-----END CERTIFICATE-----" {
                        return Ok(Some(X509::from_pem(block.as_bytes())?));
                    }
                }
                return Ok(None);
            }

            last_comment = None;
        }

        Ok(None)
    }
}

/// Extracts the Common Name from a certificate's subject, if present.
fn common_name(cert: &X509) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
}

/// Tuple-equality containment check: (subject-hash, SHA-1 fingerprint,
/// public key) must all agree for the trust-store entry to count as "the
/// same certificate" rather than merely one with the same filename or CN.
fn certs_equal(a: &X509, b: &X509) -> Result<bool, Error> {
    let same_hash = a.subject_name_hash() == b.subject_name_hash();
    let same_fingerprint = a.digest(MessageDigest::sha1())?.as_ref() == b.digest(MessageDigest::sha1())?.as_ref();
    let same_key = a.public_key()?.public_eq(&b.public_key()?);

    Ok(same_hash && same_fingerprint && same_key)
}

/// Result of validating a signer chain: the leaf's public key, released
/// only once CN, path, and OCSP checks have all succeeded.
pub struct ValidatedSigner {
    pub public_key: PKey<Public>,
}

/// Validates a signer chain against a local trust store, expected leaf CN,
/// and OCSP staple set, per the specification's three-part invariant.
pub fn verify(
    chain: &SignerChain,
    trust_store: &LocalTrustStore,
    expected_cn: &str,
    staples: &OcspStapleSet,
) -> Result<ValidatedSigner, Error> {
    let leaf_cn = common_name(chain.leaf());
    if leaf_cn.as_deref() != Some(expected_cn) {
        return Err(Error::trust(format!(
            "signer leaf CN {:?} does not match expected {expected_cn:?}",
            leaf_cn
        )));
    }

    // For every certificate in the chain, determine whether the trust
    // store already has a matching entry. This single pass feeds both the
    // path-validation trust anchors and the OCSP implicit-trust cutoff.
    let mut in_trust_store = Vec::with_capacity(chain.len());
    let mut trust_anchors: Vec<X509> = Vec::new();

    for cert in chain.certs_slice() {
        let subject_hash = cert.subject_name_hash();
        let cn = common_name(cert);
        let found = trust_store.lookup_by_subject(subject_hash, cn.as_deref())?;

        let is_trusted = match &found {
            Some(candidate) => certs_equal(cert, candidate)?,
            None => false,
        };

        if is_trusted {
            trust_anchors.push(found.expect("checked Some above"));
        }

        in_trust_store.push(is_trusted);
    }

    if !in_trust_store.iter().any(|&t| t) {
        return Err(Error::trust(
            "signer chain does not build to a locally trusted root",
        ));
    }

    validate_path(chain, &trust_anchors)?;
    validate_ocsp(chain, &in_trust_store, &trust_anchors, staples)?;

    Ok(ValidatedSigner {
        public_key: chain.leaf().public_key()?,
    })
}

fn validate_path(chain: &SignerChain, trust_anchors: &[X509]) -> Result<(), Error> {
    let mut store_builder = X509StoreBuilder::new()?;
    for anchor in trust_anchors {
        store_builder.add_cert(anchor.clone())?;
    }
    let store = store_builder.build();

    let mut untrusted = Stack::new()?;
    for cert in chain.certs_slice() {
        untrusted.push(cert.clone())?;
    }

    let mut ctx = X509StoreContext::new()?;
    let valid = ctx.init(&store, chain.leaf(), &untrusted, |ctx| ctx.verify_cert())?;

    if !valid {
        return Err(Error::trust(format!(
            "X.509 path validation failed: {}",
            ctx.error().error_string()
        )));
    }

    Ok(())
}

fn validate_ocsp(
    chain: &SignerChain,
    in_trust_store: &[bool],
    trust_anchors: &[X509],
    staples: &OcspStapleSet,
) -> Result<(), Error> {
    let certs = chain.certs_slice();

    for (i, cert) in certs.iter().enumerate() {
        if in_trust_store[i] {
            // Implicit trust: this certificate and everything toward the
            // root beyond it need not be revocation-checked.
            break;
        }

        let fingerprint = sha1_hex(&cert.to_der()?);
        let der = staples
            .get(&fingerprint)
            .ok_or_else(|| Error::trust(format!("missing OCSP staple for {fingerprint}")))?;

        let issuer = certs
            .get(i + 1)
            .or_else(|| trust_anchors.first())
            .ok_or_else(|| Error::trust("no issuer available to validate OCSP staple"))?;

        let response = OcspResponse::from_der(der)
            .map_err(|e| Error::trust(format!("malformed OCSP response: {e}")))?;
        let basic = response
            .basic()
            .map_err(|e| Error::trust(format!("OCSP response has no basic response: {e}")))?;

        let mut issuer_stack = Stack::new()?;
        issuer_stack.push(issuer.clone())?;
        let mut issuer_store = X509StoreBuilder::new()?;
        issuer_store.add_cert(issuer.clone())?;
        let issuer_store = issuer_store.build();

        let signed_ok = basic
            .verify(&issuer_stack, &issuer_store, openssl::ocsp::OcspFlag::TRUSTOTHER)
            .map_err(|e| Error::trust(format!("OCSP response signature invalid: {e}")))?;

        if !signed_ok {
            return Err(Error::trust(format!(
                "OCSP response for {fingerprint} was not signed by its issuer"
            )));
        }

        let id = OcspCertId::from_cert(MessageDigest::sha1(), cert, issuer)?;
        let status = basic
            .find_status(&id)
            .ok_or_else(|| Error::trust(format!("OCSP response does not cover {fingerprint}")))?;

        if status.status != OcspCertStatus::GOOD {
            let cn = common_name(cert).unwrap_or_else(|| fingerprint.clone());
            return Err(Error::trust(format!("certificate {cn} is not OCSP-good")));
        }
    }

    Ok(())
}

impl SignerChain {
    fn certs_slice(&self) -> &[X509] {
        &self.certs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_empty_chain() {
        assert!(SignerChain::parse(b"").is_err());
    }

    #[test]
    fn bundle_comment_lookup_finds_matching_block() {
        let bundle = "\
# Example Root CA
-----BEGIN CERTIFICATE-----
ZmFrZQ==
-----END CERTIFICATE-----
";
        // The fixture body isn't a real certificate, so this exercises only
        // the comment-scanning logic: it must locate the block rather than
        // report no match, even though parsing the bogus PEM fails.
        let result = LocalTrustStore::find_block_by_comment(bundle, "Example Root CA");
        assert!(result.is_err(), "expected a PEM parse error, not a missed match");
    }

    #[test]
    fn bundle_comment_lookup_misses_unknown_subject() {
        let bundle = "\
# Example Root CA
-----BEGIN CERTIFICATE-----
ZmFrZQ==
-----END CERTIFICATE-----
";
        let result = LocalTrustStore::find_block_by_comment(bundle, "Someone Else").unwrap();
        assert!(result.is_none());
    }
}
