//! Self-signed X.509 certificate identifying the local peer during the DTLS
//! handshake. Its SHA-256 fingerprint is announced in the local description
//! with `a=fingerprint`, and the remote peer compares it with the certificate
//! presented in-band.

use rcgen::{CertificateParams, KeyPair};
use sha2::{Digest, Sha256};

use sdp::description::FINGERPRINT_ALGORITHM;
use shared::error::Result;

/// Common name of certificates generated when the configuration carries none.
pub const DEFAULT_CERTIFICATE_NAME: &str = "rtc-peer";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    private_key_der: Vec<u8>,
    fingerprint: String,
}

impl Certificate {
    /// Generates a key pair and a certificate for `common_name` signed with it.
    pub fn generate(common_name: &str) -> Result<Self> {
        let key_pair = KeyPair::generate()?;
        let params = CertificateParams::new(vec![common_name.to_owned()])?;
        let certificate = params.self_signed(&key_pair)?;

        Ok(Certificate::from_der(
            certificate.der().to_vec(),
            key_pair.serialize_der(),
        ))
    }

    /// Wraps an existing DER certificate and its PKCS#8 DER private key.
    pub fn from_der(der: Vec<u8>, private_key_der: Vec<u8>) -> Self {
        let fingerprint = fingerprint_of(&der);
        Certificate {
            der,
            private_key_der,
            fingerprint,
        }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key_der
    }

    /// SHA-256 digest of the DER certificate, as colon separated uppercase hex.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Value of the `a=fingerprint` attribute, `sha-256 AB:CD:...`.
    pub fn fingerprint_attribute(&self) -> String {
        format!("{FINGERPRINT_ALGORITHM} {}", self.fingerprint)
    }
}

fn fingerprint_of(der: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(der);
    let hashed = h.finalize();
    let values: Vec<String> = hashed.iter().map(|x| format!("{x:02X}")).collect();
    values.join(":")
}
