//! Certificate chain verification
//!
//! Walks the decoded attestation chain: validity windows and issuer
//! signatures link by link, then the pinned-root identity check. Also
//! verifies the ECDSA signature over the signed range of the wire message.
//! Nothing here trusts the attestation extension.

use chrono::{DateTime, Utc};
use p256::ecdsa::{signature::Verifier as _, Signature, VerifyingKey};
use thiserror::Error;
use x509_parser::prelude::*;

/// Google Hardware Attestation Root
/// Subject: Serial Number = f92009e853b6b045
/// Valid: 2021-11-17 to 2036-11-13
pub const GOOGLE_ROOT_CERTIFICATE: &[u8] =
    include_bytes!("../../certs/google_hardware_attestation_root.der");

/// Required chain length for protocol version 1.
pub const CHAIN_LENGTH: usize = 4;

/// Errors from walking the certificate chain.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChainError {
    #[error("unsupported certificate chain length {0}")]
    UnsupportedChainLength(usize),

    #[error("certificate {index} could not be parsed")]
    InvalidCertificate { index: usize },

    #[error("certificate {index} is expired or not yet valid")]
    CertExpired { index: usize },

    #[error("invalid signature on certificate {index}")]
    InvalidSignatureInChain { index: usize },

    #[error("root certificate does not match the pinned root")]
    RootMismatch,
}

/// Verifies the attestation certificate chain against the pinned root.
///
/// For every certificate below the root: the validity window must contain
/// `now` and the next certificate's key must verify its signature. The last
/// certificate must be self-signed and byte-identical to `pinned_root`; its
/// validity window is not consulted.
pub fn verify_certificate_chain(
    chain: &[Vec<u8>],
    pinned_root: &[u8],
    now: DateTime<Utc>,
) -> Result<(), ChainError> {
    if chain.len() != CHAIN_LENGTH {
        return Err(ChainError::UnsupportedChainLength(chain.len()));
    }

    let mut parsed = Vec::with_capacity(chain.len());
    for (index, der) in chain.iter().enumerate() {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|_| ChainError::InvalidCertificate { index })?;
        parsed.push(cert);
    }

    let now_ts = now.timestamp();
    for index in 0..parsed.len() - 1 {
        let validity = parsed[index].validity();
        if now_ts < validity.not_before.timestamp() || now_ts > validity.not_after.timestamp() {
            return Err(ChainError::CertExpired { index });
        }

        parsed[index]
            .verify_signature(Some(parsed[index + 1].public_key()))
            .map_err(|_| ChainError::InvalidSignatureInChain { index })?;
    }

    let root_index = parsed.len() - 1;
    parsed[root_index]
        .verify_signature(Some(parsed[root_index].public_key()))
        .map_err(|_| ChainError::InvalidSignatureInChain { index: root_index })?;

    if chain[root_index] != pinned_root {
        return Err(ChainError::RootMismatch);
    }

    Ok(())
}

/// Errors from verifying the wire-message signature.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MessageSignatureError {
    #[error("signing certificate could not be parsed")]
    MalformedCertificate,

    #[error("unsupported public key type")]
    UnsupportedKey,

    #[error("signature does not verify")]
    BadSignature,
}

/// Verifies the DER-encoded ECDSA P-256 signature over the signed range,
/// using the public key of the given certificate.
pub fn verify_message_signature(
    cert_der: &[u8],
    signed: &[u8],
    signature: &[u8],
) -> Result<(), MessageSignatureError> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|_| MessageSignatureError::MalformedCertificate)?;

    let spki = cert
        .public_key()
        .parsed()
        .map_err(|_| MessageSignatureError::MalformedCertificate)?;
    let x509_parser::public_key::PublicKey::EC(point) = spki else {
        return Err(MessageSignatureError::UnsupportedKey);
    };

    let key = VerifyingKey::from_sec1_bytes(point.data())
        .map_err(|_| MessageSignatureError::UnsupportedKey)?;
    let signature =
        Signature::from_der(signature).map_err(|_| MessageSignatureError::BadSignature)?;

    key.verify(signed, &signature)
        .map_err(|_| MessageSignatureError::BadSignature)
}
