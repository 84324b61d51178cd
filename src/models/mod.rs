//! Database entity models

pub mod attestation;
pub mod pairing;

pub use attestation::AttestationRecord;
pub use pairing::PairingRecord;
