//! ICE credentials and a stand-in DTLS fingerprint.

use castkit_common::media::{DtlsFingerprint, DtlsParameters, DtlsRole, IceParameters};
use rand::Rng;
use rand::distr::Alphanumeric;
use sha2::{Digest, Sha256};

fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Fresh ICE-lite credentials for one transport.
pub fn ice_parameters() -> IceParameters {
    IceParameters {
        username_fragment: random_token(16),
        password: random_token(32),
        ice_lite: true,
    }
}

/// One fingerprint per engine, like a media worker's certificate, but
/// hashed from random bytes. Formatted `AB:CD:...`.
pub fn certificate_fingerprint() -> DtlsFingerprint {
    let seed: [u8; 32] = rand::rng().random();
    let digest = Sha256::digest(seed);
    let value = digest
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".into(),
        value,
    }
}

pub fn dtls_parameters(fingerprint: &DtlsFingerprint) -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Auto,
        fingerprints: vec![fingerprint.clone()],
    }
}
