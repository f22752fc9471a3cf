//! End-to-end scenario tests (S1-S8) for `AuthorizedKeysAgent`.
//!
//! Each scenario stands up a `wiremock` server in place of the instance
//! metadata service and calls `ec2_ssh_key_agent::agent::run` directly —
//! in-process, not by spawning the built binary — following the same
//! calls-into-the-library convention as the rest of this codebase's
//! integration tests.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::time::{SystemTime, UNIX_EPOCH};

use ec2_ssh_key_agent::cli::Args;
use ec2_ssh_key_agent::config::Config;
use ec2_ssh_key_agent::crypto::sha1_hex;
use ec2_ssh_key_agent::error::Error;
use ec2_ssh_key_agent::metadata::MetadataClient;
use ec2_ssh_key_agent::{agent, instance_guard};

use base64::Engine;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::ocsp::{OcspBasicResponse, OcspCertId, OcspCertStatus, OcspFlag, OcspResponse, OcspResponseStatus};
use openssl::pkey::{PKey, Private};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::{RsaPssSaltlen, Signer};
use openssl::stack::Stack;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509Name, X509};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const REGION: &str = "us-east-1";
const DOMAIN: &str = "amazonaws.com";
const INSTANCE_ID: &str = "i-0123456789abcdef0";

/// A genuine two-certificate signer chain: a self-signed root CA (the
/// trust anchor, installed into the fixture's trust store) and a leaf
/// signed by that root whose CN is the expected signer CN. Separating the
/// two lets scenarios exercise path validation and OCSP staple
/// verification against a certificate that is *not* itself a trust
/// anchor, rather than short-circuiting on implicit trust at the leaf.
struct SignerFixture {
    leaf_key: PKey<Private>,
    leaf_cert: X509,
    root_key: PKey<Private>,
    root_cert: X509,
    chain_pem: Vec<u8>,
    trust_dir: tempfile::TempDir,
}

fn build_self_signed_ca(cn: &str) -> (PKey<Private>, X509) {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name_builder = X509Name::builder().unwrap();
    name_builder.append_entry_by_text("CN", cn).unwrap();
    let name = name_builder.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();

    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder
        .append_extension(BasicConstraints::new().ca().build().unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    (key, builder.build())
}

fn build_leaf_cert(cn: &str, root_key: &PKey<Private>, root_cert: &X509) -> (PKey<Private>, X509) {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name_builder = X509Name::builder().unwrap();
    name_builder.append_entry_by_text("CN", cn).unwrap();
    let name = name_builder.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();

    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(root_cert.subject_name()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder.sign(root_key, MessageDigest::sha256()).unwrap();

    (key, builder.build())
}

fn build_signer_fixture() -> SignerFixture {
    let (root_key, root_cert) = build_self_signed_ca("managed-ssh-root-ca");
    let (leaf_key, leaf_cert) = build_leaf_cert(
        &format!("managed-ssh-signer.{REGION}.{DOMAIN}"),
        &root_key,
        &root_cert,
    );

    let mut chain_pem = leaf_cert.to_pem().unwrap();
    chain_pem.extend_from_slice(&root_cert.to_pem().unwrap());

    let trust_dir = tempfile::tempdir().unwrap();
    let subject_hash = root_cert.subject_name_hash();
    let file_name = format!("{subject_hash:08x}.0");
    std::fs::write(trust_dir.path().join(file_name), root_cert.to_pem().unwrap()).unwrap();

    SignerFixture {
        leaf_key,
        leaf_cert,
        root_key,
        root_cert,
        chain_pem,
        trust_dir,
    }
}

/// Builds a DER-encoded, root-signed OCSP response for the fixture's leaf
/// certificate with the given status, exercising the same
/// `OcspBasicResponse`/`OcspCertId` machinery `ChainVerifier` verifies
/// against.
fn build_ocsp_response(fixture: &SignerFixture, status: OcspCertStatus) -> Vec<u8> {
    let cert_id = OcspCertId::from_cert(MessageDigest::sha1(), &fixture.leaf_cert, &fixture.root_cert).unwrap();

    let this_update = Asn1Time::days_from_now(0).unwrap();
    let next_update = Asn1Time::days_from_now(7).unwrap();
    let revocation_time = Asn1Time::days_from_now(0).unwrap();

    let mut basic = OcspBasicResponse::new().unwrap();
    basic
        .add_status(
            &cert_id,
            status,
            0,
            if status == OcspCertStatus::REVOKED {
                Some(&revocation_time)
            } else {
                None
            },
            &this_update,
            &next_update,
        )
        .unwrap();

    let signer_certs: Stack<X509> = Stack::new().unwrap();
    basic
        .sign(&fixture.root_cert, &fixture.root_key, &signer_certs, OcspFlag::empty())
        .unwrap();

    let response = OcspResponse::create(OcspResponseStatus::SUCCESSFUL, Some(&basic)).unwrap();
    response.to_der().unwrap()
}

/// Signs `signed_data` with the fixture's leaf private key using RSA-PSS,
/// SHA-256, and salt length 32 — the exact scheme `KeyAuthorizer` verifies
/// against.
fn sign_record(fixture: &SignerFixture, signed_data: &[u8]) -> String {
    let mut signer = Signer::new(MessageDigest::sha256(), &fixture.leaf_key).unwrap();
    signer.set_rsa_padding(Padding::PKCS1_PSS).unwrap();
    signer
        .set_rsa_pss_saltlen(RsaPssSaltlen::custom(32))
        .unwrap();
    signer.update(signed_data).unwrap();
    let signature = signer.sign_to_vec().unwrap();
    base64::engine::general_purpose::STANDARD.encode(signature)
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn make_record(fixture: &SignerFixture, instance_id: &str, timestamp: i64, key_line: &str) -> String {
    let metadata = format!("#Timestamp={timestamp}\n#Instance={instance_id}\n");
    let mut signed_data = metadata.clone().into_bytes();
    signed_data.extend_from_slice(key_line.as_bytes());
    signed_data.push(b'\n');

    let signature = sign_record(fixture, &signed_data);
    format!("{metadata}{key_line}\n{signature}\n")
}

async fn mount_instance_identity(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/meta-data/instance-id/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(INSTANCE_ID))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/meta-data/placement/availability-zone/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("us-east-1a"))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/meta-data/services/domain/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(DOMAIN))
        .mount(server)
        .await;
}

fn write_passwd_fixture(user: &str) -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let passwd_path = dir.path().join("passwd");
    let mut file = std::fs::File::create(&passwd_path).unwrap();
    writeln!(file, "{user}:x:1000:1000::/home/{user}:/bin/bash").unwrap();
    (dir, passwd_path.to_string_lossy().into_owned())
}

fn hypervisor_fixture() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("uuid");
    std::fs::write(&path, b"ec2abcdef-0000-0000-0000-000000000000").unwrap();
    (dir, path.to_string_lossy().into_owned())
}

/// S1: non-instance host — no hypervisor UUID, no DMI asset tag file
/// present at the configured (fixture) paths.
#[tokio::test]
async fn s1_non_instance_host_yields_silent_noop() {
    let server = MockServer::start().await;
    mount_instance_identity(&server).await;

    let nonexistent = "/nonexistent/uuid/path/for/test";
    let config = Config::default()
        .with_metadata_base_url(server.uri())
        .with_hypervisor_uuid_path(nonexistent)
        .with_dmi_board_asset_tag_path(nonexistent);
    let metadata = MetadataClient::new(config.metadata_base_url(), config.metadata_timeout()).unwrap();

    let result = instance_guard::resolve(&config, &metadata).await;
    assert!(matches!(result, Err(Error::NotAnInstance)));
}

/// S2: the named user does not exist locally.
#[tokio::test]
async fn s2_unknown_user_yields_silent_noop() {
    let args = Args {
        user: "definitely-not-a-real-user-for-this-test".to_string(),
        expected_fingerprint: None,
    };
    let config = Config::default();
    let metadata = MetadataClient::new(config.metadata_base_url(), config.metadata_timeout()).unwrap();

    // The user check runs before any metadata fetch, so no mock server is
    // needed here: `agent::run` returns as soon as `/etc/passwd` doesn't
    // name this user.
    let result = agent::run(&config, &args, &metadata).await;
    assert!(matches!(result, Err(Error::UnknownUser)));
}

/// S3: HEAD on the active-keys path returns 404; no signer-cert fetch
/// should be necessary (wiremock would simply have nothing mounted for it,
/// and any such request would 404 as an unregistered route).
#[tokio::test]
async fn s3_no_active_keys_yields_silent_noop() {
    let server = MockServer::start().await;
    mount_instance_identity(&server).await;
    let (_hv_dir, hv_path) = hypervisor_fixture();

    Mock::given(method("HEAD"))
        .and(path("/meta-data/managed-ssh-keys/active-keys/root/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let args = Args {
        user: "root".to_string(),
        expected_fingerprint: None,
    };
    let config = Config::default()
        .with_metadata_base_url(server.uri())
        .with_hypervisor_uuid_path(hv_path);
    let metadata = MetadataClient::new(config.metadata_base_url(), config.metadata_timeout()).unwrap();

    let result = agent::run(&config, &args, &metadata).await;
    assert!(matches!(result, Err(Error::NoKeysForUser)));
}

async fn mount_happy_path(server: &MockServer, fixture: &SignerFixture, record_blob: String) {
    mount_instance_identity(server).await;

    Mock::given(method("HEAD"))
        .and(path("/meta-data/managed-ssh-keys/active-keys/root/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/meta-data/managed-ssh-keys/active-keys/root/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(record_blob))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/meta-data/managed-ssh-keys/signer-cert/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(fixture.chain_pem.clone()))
        .mount(server)
        .await;

    let token = sha1_hex(&fixture.leaf_cert.to_der().unwrap());
    let staple = build_ocsp_response(fixture, OcspCertStatus::GOOD);
    let encoded = base64::engine::general_purpose::STANDARD.encode(staple);

    Mock::given(method("GET"))
        .and(path("/meta-data/managed-ssh-keys/signer-ocsp/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!("{token}\n")))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/meta-data/managed-ssh-keys/signer-ocsp/{token}"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_string(encoded))
        .mount(server)
        .await;
}

/// S4: happy path — one valid, unexpired, correctly bound record, with a
/// real `good` OCSP staple covering the leaf.
#[tokio::test]
async fn s4_happy_path_emits_the_key() {
    let fixture = build_signer_fixture();
    let server = MockServer::start().await;
    let (_hv_dir, hv_path) = hypervisor_fixture();
    let scratch_parent = tempfile::tempdir().unwrap();

    let key_line = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBogus carol@example.com";
    let record = make_record(&fixture, INSTANCE_ID, now_unix() + 60, key_line);

    mount_happy_path(&server, &fixture, record).await;

    let args = Args {
        user: "root".to_string(),
        expected_fingerprint: None,
    };
    let config = Config::default()
        .with_metadata_base_url(server.uri())
        .with_hypervisor_uuid_path(hv_path)
        .with_trust_store_path(fixture.trust_dir.path().to_string_lossy().to_string())
        .with_scratch_parent(scratch_parent.path().to_string_lossy().to_string());
    let metadata = MetadataClient::new(config.metadata_base_url(), config.metadata_timeout()).unwrap();

    let result = agent::run(&config, &args, &metadata).await.unwrap();
    assert_eq!(result, vec![key_line.to_string()]);

    assert!(
        std::fs::read_dir(scratch_parent.path())
            .unwrap()
            .next()
            .is_none(),
        "scratch directory was not removed after run() returned"
    );
}

/// S5: same as S4 but the record's timestamp is already in the past.
#[tokio::test]
async fn s5_expired_record_is_rejected() {
    let fixture = build_signer_fixture();
    let server = MockServer::start().await;
    let (_hv_dir, hv_path) = hypervisor_fixture();

    let key_line = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBogus carol@example.com";
    let record = make_record(&fixture, INSTANCE_ID, now_unix() - 1, key_line);

    mount_happy_path(&server, &fixture, record).await;

    let args = Args {
        user: "root".to_string(),
        expected_fingerprint: None,
    };
    let config = Config::default()
        .with_metadata_base_url(server.uri())
        .with_hypervisor_uuid_path(hv_path)
        .with_trust_store_path(fixture.trust_dir.path().to_string_lossy().to_string());
    let metadata = MetadataClient::new(config.metadata_base_url(), config.metadata_timeout()).unwrap();

    let result = agent::run(&config, &args, &metadata).await;
    assert!(matches!(result, Err(Error::NoValidKey { attempted: 1 })));
}

/// S6: same as S4 but the record names a different instance.
#[tokio::test]
async fn s6_wrong_instance_binding_is_rejected() {
    let fixture = build_signer_fixture();
    let server = MockServer::start().await;
    let (_hv_dir, hv_path) = hypervisor_fixture();

    let key_line = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBogus carol@example.com";
    let record = make_record(&fixture, "i-ffffffffffffffffe", now_unix() + 60, key_line);

    mount_happy_path(&server, &fixture, record).await;

    let args = Args {
        user: "root".to_string(),
        expected_fingerprint: None,
    };
    let config = Config::default()
        .with_metadata_base_url(server.uri())
        .with_hypervisor_uuid_path(hv_path)
        .with_trust_store_path(fixture.trust_dir.path().to_string_lossy().to_string());
    let metadata = MetadataClient::new(config.metadata_base_url(), config.metadata_timeout()).unwrap();

    let result = agent::run(&config, &args, &metadata).await;
    assert!(matches!(result, Err(Error::NoValidKey { attempted: 1 })));
}

/// S7: the leaf's OCSP staple is present but genuinely `revoked` —
/// exercises `ChainVerifier`'s actual status-check branch (not merely the
/// earlier "missing staple" or "no trusted root" gates).
#[tokio::test]
async fn s7_revoked_ocsp_staple_blocks_emission() {
    let fixture = build_signer_fixture();
    let server = MockServer::start().await;
    let (_hv_dir, hv_path) = hypervisor_fixture();

    let key_line = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBogus carol@example.com";
    let record = make_record(&fixture, INSTANCE_ID, now_unix() + 60, key_line);

    mount_instance_identity(&server).await;
    Mock::given(method("HEAD"))
        .and(path("/meta-data/managed-ssh-keys/active-keys/root/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/meta-data/managed-ssh-keys/active-keys/root/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(record))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/meta-data/managed-ssh-keys/signer-cert/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(fixture.chain_pem.clone()))
        .mount(&server)
        .await;

    let token = sha1_hex(&fixture.leaf_cert.to_der().unwrap());
    let staple = build_ocsp_response(&fixture, OcspCertStatus::REVOKED);
    let encoded = base64::engine::general_purpose::STANDARD.encode(staple);

    Mock::given(method("GET"))
        .and(path("/meta-data/managed-ssh-keys/signer-ocsp/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!("{token}\n")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/meta-data/managed-ssh-keys/signer-ocsp/{token}"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_string(encoded))
        .mount(&server)
        .await;

    let args = Args {
        user: "root".to_string(),
        expected_fingerprint: None,
    };
    let config = Config::default()
        .with_metadata_base_url(server.uri())
        .with_hypervisor_uuid_path(hv_path)
        .with_trust_store_path(fixture.trust_dir.path().to_string_lossy().to_string());
    let metadata = MetadataClient::new(config.metadata_base_url(), config.metadata_timeout()).unwrap();

    let result = agent::run(&config, &args, &metadata).await;
    assert!(matches!(result, Err(Error::TrustFailure { .. })));
}

/// S8: two valid records, fingerprint filter selects only the second.
#[tokio::test]
async fn s8_fingerprint_filter_selects_one_key() {
    let fixture = build_signer_fixture();
    let server = MockServer::start().await;
    let (_hv_dir, hv_path) = hypervisor_fixture();

    let key_line_1 = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFirstKeyBogusData carol@example.com";
    let key_line_2 = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAISecondKeyBogusDat carol@example.com";

    let record_1 = make_record(&fixture, INSTANCE_ID, now_unix() + 60, key_line_1);
    let record_2 = make_record(&fixture, INSTANCE_ID, now_unix() + 60, key_line_2);
    let blob = format!("{record_1}\n{record_2}");

    mount_happy_path(&server, &fixture, blob).await;

    let expected_fingerprint = {
        let blob_field = key_line_2.split_whitespace().nth(1).unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(blob_field)
            .unwrap();
        ec2_ssh_key_agent::crypto::ssh_fingerprint(&decoded)
    };

    let args = Args {
        user: "root".to_string(),
        expected_fingerprint: Some(expected_fingerprint),
    };
    let config = Config::default()
        .with_metadata_base_url(server.uri())
        .with_hypervisor_uuid_path(hv_path)
        .with_trust_store_path(fixture.trust_dir.path().to_string_lossy().to_string());
    let metadata = MetadataClient::new(config.metadata_base_url(), config.metadata_timeout()).unwrap();

    let result = agent::run(&config, &args, &metadata).await.unwrap();
    assert_eq!(result, vec![key_line_2.to_string()]);
}

/// Sanity check that the trust-store fixture itself is readable with the
/// owner-only permissions the specification expects of scratch-area
/// output (exercised here on the fixture directory, not a real scratch
/// dir, since this function only builds certificates).
#[test]
fn trust_dir_fixture_is_readable() {
    let fixture = build_signer_fixture();
    let metadata = std::fs::metadata(fixture.trust_dir.path()).unwrap();
    assert!(metadata.permissions().mode() & 0o700 != 0);
}

/// Confirms `write_passwd_fixture` itself writes a parseable line, since
/// S2 relies on the real `/etc/passwd` of the test host rather than this
/// helper — this guards the helper for any scenario that does come to use
/// it.
#[test]
fn passwd_fixture_contains_requested_user() {
    let (_dir, path) = write_passwd_fixture("carol");
    let contents = std::fs::read_to_string(path).unwrap();
    assert!(contents.starts_with("carol:"));
}
