//! Service modules for the attestation server
//!
//! The verification pipeline is composed from these modules: codec →
//! chain → extension → policy, orchestrated by the verifier over the
//! challenge and pinning stores.

pub mod catalog;
pub mod chain;
pub mod challenge_store;
pub mod codec;
pub mod extension;
pub mod pinning;
pub mod policy;
pub mod verifier;

pub use challenge_store::ChallengeStore;
pub use codec::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
pub use pinning::PinningStore;
pub use verifier::{VerificationResult, Verifier, VerifyError};
