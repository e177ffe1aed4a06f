//! Signed envelope around a serialized manifest. The inner text is signed
//! exactly as given and verified byte-exact; chain validation against a
//! trust anchor and signature verification are independent checks, and
//! failing either rejects the whole envelope.

use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::path::Path;
use x509_parser::certificate::X509Certificate;
use x509_parser::oid_registry::OID_SIG_ED25519;
use x509_parser::pem::Pem;

use crate::error::{ManifestError, Result};

/// Wire envelope: leaf certificate, untrusted chain material, hex signature,
/// and the exact inner manifest JSON text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub cert: String,
    #[serde(default)]
    pub other_certs: Vec<String>,
    pub sig: String,
    pub inner: String,
}

/// Signs manifest bytes with the leaf certificate's Ed25519 key.
pub struct Wrapper {
    signing_key: SigningKey,
    cert_pem: String,
    other_cert_pems: Vec<String>,
}

impl Wrapper {
    pub fn new(key_pem: &str, cert_pem: String, other_cert_pems: Vec<String>) -> Result<Self> {
        let signing_key = SigningKey::from_pkcs8_pem(key_pem)
            .map_err(|e| ManifestError::Key(format!("cannot load signing key: {}", e)))?;
        Ok(Self {
            signing_key,
            cert_pem,
            other_cert_pems,
        })
    }

    pub fn from_pem_files(key: &Path, cert: &Path, other_certs: &[impl AsRef<Path>]) -> Result<Self> {
        let key_pem = std::fs::read_to_string(key)?;
        let cert_pem = std::fs::read_to_string(cert)?;
        let other_cert_pems = other_certs
            .iter()
            .map(|p| std::fs::read_to_string(p.as_ref()))
            .collect::<std::io::Result<Vec<_>>>()?;
        Self::new(&key_pem, cert_pem, other_cert_pems)
    }

    /// Wrap `inner` as given; no re-serialization happens, so verification
    /// on the other side is byte-exact.
    pub fn wrap(&self, inner: &str) -> SignedEnvelope {
        let sig = self.signing_key.sign(inner.as_bytes());
        SignedEnvelope {
            cert: self.cert_pem.clone(),
            other_certs: self.other_cert_pems.clone(),
            sig: hex::encode(sig.to_bytes()),
            inner: inner.to_string(),
        }
    }
}

/// Verifies envelopes against a configured trust anchor.
pub struct Verifier {
    anchor_pem: Vec<u8>,
}

impl Verifier {
    pub fn new(trust_anchor_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            anchor_pem: trust_anchor_pem.into(),
        }
    }

    pub fn from_pem_file(path: &Path) -> Result<Self> {
        Ok(Self::new(std::fs::read(path)?))
    }

    /// Validate the certificate chain, then the signature over the exact
    /// inner bytes. Returns the inner manifest JSON text.
    pub fn unwrap(&self, envelope: &SignedEnvelope) -> Result<String> {
        let leaf_pems = parse_pems(envelope.cert.as_bytes())?;
        let leaf_pem = leaf_pems
            .first()
            .ok_or_else(|| ManifestError::InvalidCertChain("no leaf certificate".into()))?;
        let leaf = parse_cert(leaf_pem)?;

        let untrusted_pems: Vec<Pem> = envelope
            .other_certs
            .iter()
            .map(|pem| parse_pems(pem.as_bytes()))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();
        let untrusted: Vec<X509Certificate> = untrusted_pems
            .iter()
            .map(parse_cert)
            .collect::<Result<Vec<_>>>()?;

        let anchor_pems = parse_pems(&self.anchor_pem)?;
        let anchors: Vec<X509Certificate> = anchor_pems
            .iter()
            .map(parse_cert)
            .collect::<Result<Vec<_>>>()?;

        validate_chain(&leaf, &untrusted, &anchors)?;
        verify_inner_signature(&leaf, &envelope.sig, envelope.inner.as_bytes())?;

        Ok(envelope.inner.clone())
    }
}

fn parse_pems(bytes: &[u8]) -> Result<Vec<Pem>> {
    Pem::iter_from_buffer(bytes)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ManifestError::InvalidCertChain(format!("bad PEM: {}", e)))
}

fn parse_cert(pem: &Pem) -> Result<X509Certificate<'_>> {
    pem.parse_x509()
        .map_err(|e| ManifestError::InvalidCertChain(format!("bad certificate: {}", e)))
}

/// Walk issuer links from the leaf through the untrusted pool until a
/// configured anchor signs the path. Every link's signature and validity
/// window must check out.
fn validate_chain(
    leaf: &X509Certificate,
    untrusted: &[X509Certificate],
    anchors: &[X509Certificate],
) -> Result<()> {
    if !leaf.validity().is_valid() {
        return Err(ManifestError::InvalidCertChain(
            "leaf certificate expired or not yet valid".into(),
        ));
    }

    let mut current = leaf;
    let mut used = vec![false; untrusted.len()];

    // The pool is small; a linear walk bounded by its size cannot loop.
    for _ in 0..=untrusted.len() {
        for anchor in anchors {
            if anchor.subject() == current.issuer()
                && anchor.validity().is_valid()
                && current.verify_signature(Some(anchor.public_key())).is_ok()
            {
                return Ok(());
            }
        }

        let next = untrusted.iter().enumerate().find(|(idx, candidate)| {
            !used[*idx]
                && candidate.subject() == current.issuer()
                && candidate.validity().is_valid()
                && current
                    .verify_signature(Some(candidate.public_key()))
                    .is_ok()
        });
        match next {
            Some((idx, candidate)) => {
                used[idx] = true;
                current = candidate;
            }
            None => break,
        }
    }

    Err(ManifestError::InvalidCertChain(format!(
        "no path to a trust anchor for certificate issued by {}",
        leaf.issuer()
    )))
}

fn verify_inner_signature(leaf: &X509Certificate, sig_hex: &str, inner: &[u8]) -> Result<()> {
    let spki = leaf.public_key();
    if spki.algorithm.algorithm != OID_SIG_ED25519 {
        return Err(ManifestError::InvalidCertChain(
            "leaf certificate key is not Ed25519".into(),
        ));
    }
    let key_bytes: [u8; 32] = spki
        .subject_public_key
        .data
        .as_ref()
        .try_into()
        .map_err(|_| ManifestError::InvalidSignature)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| ManifestError::InvalidSignature)?;

    let sig_bytes: [u8; 64] = hex::decode(sig_hex)
        .map_err(|_| ManifestError::InvalidSignature)?
        .try_into()
        .map_err(|_| ManifestError::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify(inner, &signature)
        .map_err(|_| ManifestError::InvalidSignature)
}
