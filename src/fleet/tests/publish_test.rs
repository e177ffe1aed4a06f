//! Publisher end to end: build from the store, sign, install, and verify
//! that the unsigned manifest drives carry-forward on the next pass.

use std::path::Path;

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use fleet::publish::{Publisher, SIGNED_NAME, UNSIGNED_NAME};
use manifest::{Manifest, SignedEnvelope, Verifier, Wrapper};

fn make_wrapper_and_verifier() -> (Wrapper, Verifier) {
    let ca_signing = SigningKey::from_bytes(&[7u8; 32]);
    let ca_key = rcgen::KeyPair::try_from(ca_signing.to_pkcs8_der().unwrap().as_bytes()).unwrap();
    let mut params = rcgen::CertificateParams::new(Vec::new()).unwrap();
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, "publish test ca");
    params.distinguished_name = dn;
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca_cert = params.self_signed(&ca_key).unwrap();

    let leaf_signing = SigningKey::from_bytes(&[8u8; 32]);
    let leaf_key = rcgen::KeyPair::try_from(leaf_signing.to_pkcs8_der().unwrap().as_bytes()).unwrap();
    let mut params = rcgen::CertificateParams::new(Vec::new()).unwrap();
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, "publish test signer");
    params.distinguished_name = dn;
    let leaf_cert = params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    let key_pem = leaf_signing.to_pkcs8_pem(LineEnding::LF).unwrap().to_string();
    let wrapper = Wrapper::new(&key_pem, leaf_cert.pem(), vec![]).unwrap();
    let verifier = Verifier::new(ca_cert.pem());
    (wrapper, verifier)
}

fn read_signed(dir: &Path, verifier: &Verifier) -> Manifest {
    let text = std::fs::read_to_string(dir.join(SIGNED_NAME)).unwrap();
    let envelope: SignedEnvelope = serde_json::from_str(&text).unwrap();
    Manifest::from_json(&verifier.unwrap(&envelope).unwrap()).unwrap()
}

#[test]
fn publishes_signed_and_unsigned_manifests() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("1000.iso"), b"one").unwrap();
    std::fs::write(dir.path().join("2000.iso"), b"two").unwrap();

    let (wrapper, verifier) = make_wrapper_and_verifier();
    let publisher = Publisher::new(dir.path(), 500, None, wrapper);
    let built = publisher.publish().unwrap();

    assert_eq!(
        built.images.iter().map(|i| i.timestamp).collect::<Vec<_>>(),
        vec![2000, 1000]
    );
    assert!(built.images.iter().all(|i| i.rollout == 500));

    // Signed copy verifies and matches what was built.
    assert_eq!(read_signed(dir.path(), &verifier), built);
    // Unsigned copy is the carry-forward cache.
    let unsigned = std::fs::read_to_string(dir.path().join(UNSIGNED_NAME)).unwrap();
    assert_eq!(Manifest::from_json(&unsigned).unwrap(), built);
}

#[test]
fn republish_carries_hashes_and_rollouts_forward() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("1000.iso"), b"one").unwrap();

    let (wrapper, verifier) = make_wrapper_and_verifier();
    let publisher = Publisher::new(dir.path(), 0, None, wrapper);
    let first = publisher.publish().unwrap();

    // Operator raises the rollout fraction in the unsigned manifest.
    let mut edited = first.clone();
    edited.images[0].rollout = 10_000;
    std::fs::write(
        dir.path().join(UNSIGNED_NAME),
        edited.to_json().unwrap(),
    )
    .unwrap();

    // The file changes on disk, but its recorded hash is write-once.
    std::fs::write(dir.path().join("1000.iso"), b"mutated").unwrap();
    std::fs::write(dir.path().join("2000.iso"), b"two").unwrap();

    let second = publisher.publish().unwrap();
    let one = second.find(1000).unwrap();
    assert_eq!(one.hash, first.images[0].hash);
    assert_eq!(one.rollout, 10_000);
    let two = second.find(2000).unwrap();
    assert_eq!(two.rollout, 0);

    assert_eq!(read_signed(dir.path(), &verifier), second);
}
