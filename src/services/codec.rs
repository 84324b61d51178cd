//! Attestation wire-format codec
//!
//! Splits the framed attestation message and inflates the compressed
//! certificate chain. Layout (big-endian multi-byte):
//!
//! ```text
//! version:            u8
//! compressed_len:     u16
//! compressed_chain:   compressed_len bytes (raw DEFLATE, preset dictionary)
//! persistent_fpr:     32 bytes
//! os_enforced_flags:  u8
//! signature:          rest of payload
//! ```
//!
//! The inflated chain is a concatenation of `[u16 len][DER]` records. The
//! codec only splits framing; certificate contents are validated elsewhere.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::{Decompress, FlushDecompress, Status};
use std::sync::LazyLock;
use thiserror::Error;

/// Highest wire protocol version this server understands.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum accepted size of a serialized attestation message.
pub const MAX_MESSAGE_SIZE: usize = 2953;

/// Inflate budget for the encoded certificate chain.
pub const MAX_ENCODED_CHAIN_LENGTH: usize = 3000;

/// Length of the persistent key fingerprint.
pub const FINGERPRINT_LENGTH: usize = 32;

// Preset dictionary for the raw-DEFLATE chain compression, derived from a
// corpus of sample attestation chains. Fixed for protocol version 1.
const DEFLATE_DICTIONARY_B64: &str = concat!(
    "m2RSuqKo5vSn1/0ZFyUBABzD2nJiG0Wsp8XPLH9HseBvwntZkneIxRA3sRNSzDQznkhrP+k0ObBB",
    "xXwAusk5h2879rt7287DaicW42i6ctb3Xz4aNpow9YOwNMgaEy1DBsy04PnTafhXHHm+YPoiHyno",
    "/HuiknN2ccqz8RQjY04M6++7Tk9tTL170/I254l82mgVKLHEY3oOu/Cq1z3uYxOLEOTIokxBdpg2",
    "cg5BI+S4Uc4FyOFG0sr/OCaUsoASZVe5uY8BQbIF4u3umR3tsx7qZGxYUpB1UCL/96B23Ty+qVXE",
    "DyyX30HKRJCI0l59olZ6ZU37o7NtZUR23ePd1q/g0VDaOTqNGpB6yvB0H6dl3qlSwf4Qn917JS8S",
    "xvTLYsQCFXW00uDe5VX8uzXtBUXGEJWFjahEAKqKQ5aprxn4HN02hV7WHT6fszZnqbviO79b2PTl",
    "PzHW5BazQ/ypPF4FSCE57NbxhBAD0Wvg+KXDIdvcie2ORm2RKsEHEezPwkyUO+gC+TSHTfDvP/+M",
    "9/6QFN3wMrsUUxjE19VnbW9A8jOEjXTpEQO5H3tx6jF9/C61Co2yzh8yHcYP+YenFm0JuJEl9NTC",
    "zlEfKOAarGBq5S/6WX2iGrNi+P2NjZ3OFwqoh09ZJ0/l8xNeiqVRiDrkyOhJO3XmbgIT8DPWw0W5",
    "qBetsGjkirZMujWINnoqv++qszhZgA29XQOiUuVtcEtWvaqkI54ERnMqe2NrGcm2HihFs9+21vke",
    "lYogA2ITH9xXFujPMA5cKcwbD4C37XoWixaqhUkjO23q3YqFWVFJl5s1cE7GvbcrjtCX1/Tip9T/",
    "EbO7zObJYshNToapzOjWdEhgE8jdP9Hn0jBd56yxUh3TUHGk7rfQQQeEGmB833Dzvm+MldMkdwHe",
    "8myRHFx3xLBvc3lyg5XXb5ViDayDJVgAZvxyhBmMhmxU57vTP/jlO+ngje7c/XscvQ1p32p296hs",
    "GnaLssv9ZLFH8RPeCrivRlvlDvEb55ACK+hfCScof0dww5fX8lwxBBR9aL2PpQymamSoTPsmKAfY",
    "4qWQnXukMDbV+BASC5fLsjzsJJLZ4jVQAp3n9DEzG8UVUVuhOX87lZEWQBO17pJjUmwMsai9F3bp",
    "1IJK1gnGGYy97qlxjCzSPzRnw9jVr4KoGm9fPqe4M/DXCvsjuyBLC0/wULb7NxxkpI1OnIm6/GEo",
    "LDPpRzA7lC1pGcIsl1sL9TZfHEGEvZ+d+XXvUvW+S6CyjfSedeyejadqxQfYcSvjcsdVR67aic3C",
    "SMyoyqZccRtpipmOP1SfgBd2gtEa/imUF/WgNPUd7x5Imnhanhgm3VLvYJ9mqBfR7+2P5SwnuJHU",
    "4T5NQAxDFRKVeTYGdE0cMnMm0KykIXZkmDuHnsFNxJjhompHjSqj7kTK12+YnDSmg4MWphKOJf03",
    "vVVygbdrtF6rGv4R79yMNrdwMN5q4lUzXpA7ZrLFNuJfBMO9YwMppx9nqPXOHYa7O27CFY6LHsyG",
    "OFvPsr/L8GyGWMxxn5JgEtop/lGmP14PYxdP9EwQYO9U02JvmZYBGa5sXRGRM8Pu1Sy9xUxIAK/Z",
    "0TiV+vNTNY8BQrQcNjNkEdre+UMDSoIXAGeW3O8WZ6agqZO/0G16mIhd5qKvkm7DW4IHy3fGYNQf",
    "53De2o0VczqBku/dTo3dicLgW3h5dzjN3cpl1g2D6lKGvZROv919CN15QgwEPp3+0dGsESyP8qYA",
    "JkZievv/JLVwPYdwDpABMqeE9E/6Ui/oc29+fClJjA07qdKG+e2+b6audIFhXGj157blFB2ufdgc",
    "3hZvAUxNRN8yHfJ45+76i8ccPMMZb6HOK20YwgZI5SAUjexygl2tVUze9LRnrsb1r9OZ7TlqDgJz",
    "QfWBRhmyafjIlWSlSP70ASyCBGH3yf5UQVAas1GQrC3HjJMtjHY9jhqR294yMS8/nmx+wy7CaZk9",
    "UouqVgwu0Tch+O3YbXrXlCU8QhS5l3ZEQe0QiD06xJGuOdDkDkMAfgLk0zbJdkzIALtiDEPW",
);

static DEFLATE_DICTIONARY: LazyLock<Vec<u8>> = LazyLock::new(|| {
    STANDARD
        .decode(DEFLATE_DICTIONARY_B64)
        .expect("invalid deflate dictionary constant")
});

/// Errors that can occur while decoding a wire message.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Message declares a protocol version newer than this server
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Message is shorter than its framing requires, or the compressed
    /// chain stream is corrupt
    #[error("truncated or malformed attestation message")]
    TruncatedMessage,

    /// Inflating the certificate chain did not finish within the budget
    #[error("certificate chain exceeds the decompression budget")]
    ChainTooLarge,

    /// The OS-enforced flag byte violates its internal invariant
    #[error("invalid OS-enforced flags")]
    InvalidFlags,
}

/// OS-enforced state flags reported by the Auditor, one bit each.
///
/// Unknown bits are preserved but ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsEnforcedFlags(u8);

impl OsEnforcedFlags {
    const USER_PROFILE_SECURE: u8 = 1;
    const ACCESSIBILITY_ENABLED: u8 = 1 << 1;
    const DEVICE_ADMIN: u8 = 1 << 2;
    const ADB_ENABLED: u8 = 1 << 3;
    const ADD_USERS_WHEN_LOCKED: u8 = 1 << 4;
    const ENROLLED_FINGERPRINTS: u8 = 1 << 5;
    const DENY_NEW_USB: u8 = 1 << 6;
    const DEVICE_ADMIN_NON_SYSTEM: u8 = 1 << 7;

    /// Validates the flag byte. A non-system device administrator implies a
    /// device administrator.
    pub fn new(bits: u8) -> Result<Self, DecodeError> {
        if bits & Self::DEVICE_ADMIN_NON_SYSTEM != 0 && bits & Self::DEVICE_ADMIN == 0 {
            return Err(DecodeError::InvalidFlags);
        }
        Ok(Self(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn user_profile_secure(self) -> bool {
        self.0 & Self::USER_PROFILE_SECURE != 0
    }

    pub fn accessibility_enabled(self) -> bool {
        self.0 & Self::ACCESSIBILITY_ENABLED != 0
    }

    pub fn device_admin(self) -> bool {
        self.0 & Self::DEVICE_ADMIN != 0
    }

    pub fn adb_enabled(self) -> bool {
        self.0 & Self::ADB_ENABLED != 0
    }

    pub fn add_users_when_locked(self) -> bool {
        self.0 & Self::ADD_USERS_WHEN_LOCKED != 0
    }

    pub fn enrolled_fingerprints(self) -> bool {
        self.0 & Self::ENROLLED_FINGERPRINTS != 0
    }

    pub fn deny_new_usb(self) -> bool {
        self.0 & Self::DENY_NEW_USB != 0
    }

    pub fn device_admin_non_system(self) -> bool {
        self.0 & Self::DEVICE_ADMIN_NON_SYSTEM != 0
    }
}

/// A decoded attestation message.
///
/// `signed_range` and `signature` borrow from the request body;
/// concatenated they reconstruct the original payload.
#[derive(Debug)]
pub struct AttestationMessage<'a> {
    pub version: u8,
    /// Inflated certificate chain, leaf first
    pub chain: Vec<Vec<u8>>,
    pub persistent_key_fingerprint: [u8; FINGERPRINT_LENGTH],
    pub os_enforced_flags: OsEnforcedFlags,
    /// Everything before the signature suffix
    pub signed_range: &'a [u8],
    pub signature: &'a [u8],
}

/// Decodes a framed attestation message.
pub fn decode(bytes: &[u8]) -> Result<AttestationMessage<'_>, DecodeError> {
    if bytes.len() < 3 {
        return Err(DecodeError::TruncatedMessage);
    }

    let version = bytes[0];
    if version > PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let compressed_len = usize::from(u16::from_be_bytes([bytes[1], bytes[2]]));
    let signed_len = 3 + compressed_len + FINGERPRINT_LENGTH + 1;

    // The signature suffix must be non-empty.
    if bytes.len() <= signed_len {
        return Err(DecodeError::TruncatedMessage);
    }

    let compressed = &bytes[3..3 + compressed_len];
    let chain = split_chain(&inflate_chain(compressed)?)?;

    let mut fingerprint = [0u8; FINGERPRINT_LENGTH];
    fingerprint.copy_from_slice(&bytes[3 + compressed_len..3 + compressed_len + FINGERPRINT_LENGTH]);

    let os_enforced_flags = OsEnforcedFlags::new(bytes[signed_len - 1])?;

    Ok(AttestationMessage {
        version,
        chain,
        persistent_key_fingerprint: fingerprint,
        os_enforced_flags,
        signed_range: &bytes[..signed_len],
        signature: &bytes[signed_len..],
    })
}

/// Inflates the raw-DEFLATE chain stream within the fixed budget.
fn inflate_chain(compressed: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut inflater = Decompress::new(false);
    inflater
        .set_dictionary(&DEFLATE_DICTIONARY)
        .map_err(|_| DecodeError::TruncatedMessage)?;

    let mut inflated = vec![0u8; MAX_ENCODED_CHAIN_LENGTH];
    let status = inflater
        .decompress(compressed, &mut inflated, FlushDecompress::Finish)
        .map_err(|_| DecodeError::TruncatedMessage)?;

    let produced =
        usize::try_from(inflater.total_out()).map_err(|_| DecodeError::ChainTooLarge)?;
    match status {
        Status::StreamEnd => {
            inflated.truncate(produced);
            Ok(inflated)
        }
        // Output buffer exhausted before the stream ended: over budget.
        _ if produced == MAX_ENCODED_CHAIN_LENGTH => Err(DecodeError::ChainTooLarge),
        // Input ran out mid-stream.
        _ => Err(DecodeError::TruncatedMessage),
    }
}

/// Splits the inflated `[u16 len][DER]` record stream into certificates.
fn split_chain(encoded: &[u8]) -> Result<Vec<Vec<u8>>, DecodeError> {
    let mut chain = Vec::new();
    let mut rest = encoded;
    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(DecodeError::TruncatedMessage);
        }
        let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
        rest = &rest[2..];
        if rest.len() < len {
            return Err(DecodeError::TruncatedMessage);
        }
        chain.push(rest[..len].to_vec());
        rest = &rest[len..];
    }
    Ok(chain)
}
