//! Attestation audit log entity model

/// One append-only audit log entry, written for every successful
/// verification.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AttestationRecord {
    /// Monotonic row ID
    pub id: i64,

    /// Persistent key fingerprint of the verified device
    pub fingerprint: Vec<u8>,

    /// Whether the verification was pinned against an existing pairing
    pub strong: bool,

    /// Rendered TEE-enforced report block
    pub tee_enforced: String,

    /// Rendered OS-enforced report block
    pub os_enforced: String,
}
