//! Pairing record entity model
//!
//! Represents the per-device pinning record created on first contact.

/// The durable pinning record for one paired device.
///
/// Keyed by the persistent key fingerprint (SHA-256 of the DER of the
/// device's long-lived attestation certificate). The intermediate
/// certificates and the verified boot key are immutable after creation;
/// the version fields only ever move forward.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PairingRecord {
    /// Persistent key fingerprint, 32 bytes
    pub fingerprint: Vec<u8>,

    /// DER of the pinned attestation certificate
    pub pinned_certificate_0: Vec<u8>,

    /// DER of the first pinned intermediate
    pub pinned_certificate_1: Vec<u8>,

    /// DER of the second pinned intermediate
    pub pinned_certificate_2: Vec<u8>,

    /// Verified boot key pinned at pairing time, 32 bytes
    pub pinned_verified_boot_key: Vec<u8>,

    /// Highest OS version seen for this device
    pub pinned_os_version: i64,

    /// Highest OS patch level seen (YYYYMM)
    pub pinned_os_patch_level: i64,

    /// Highest Auditor app version seen
    pub pinned_app_version: i64,

    /// First successful verification, epoch millis
    pub verified_time_first: i64,

    /// Most recent successful verification, epoch millis
    pub verified_time_last: i64,
}
