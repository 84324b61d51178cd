//! Attestation content policy
//!
//! Runs only on a chain that has already passed verification. Applies the
//! content checks in a fixed order, first failure wins: challenge binding,
//! app identity, OS floors, root of trust, key provenance, and per-device
//! version floors.

use thiserror::Error;

use super::catalog::{self, OsVariant};
use super::challenge_store::ChallengeStore;
use super::extension::{
    AuthorizationList, KeyDescription, KeyOrigin, SecurityLevel, VerifiedBootState,
};

/// Package name of the Auditor app.
pub const AUDITOR_PACKAGE_NAME: &str = "co.copperhead.attestation";

/// Oldest Auditor app version allowed to submit attestations.
pub const AUDITOR_MINIMUM_VERSION: i64 = 7;

/// Oldest OS version accepted (8.0.0).
pub const OS_VERSION_FLOOR: i64 = 80000;

/// Oldest OS security patch level accepted (2018-01).
pub const OS_PATCH_LEVEL_FLOOR: i64 = 201_801;

// SHA-256 digests of the Auditor app signing certificates.
const RELEASE_SIGNATURE_DIGEST: &str =
    "a54b5dff9c610c1f69d2e9111b323f8d38903b890c3910ea427d66508b89e72d";
const DEBUG_SIGNATURE_DIGEST: &str =
    "ffd74c7afbb8fc4850c874867beb18c87a100d9f2f313e483dfb2b23254d975a";

/// Policy violations, in check order.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PolicyError {
    #[error("challenge is not pending")]
    ChallengeNotPending,

    #[error("attestation was not generated by the Auditor app")]
    WrongApp,

    #[error("Auditor app is too old")]
    AppTooOld,

    #[error("Auditor app signature does not match")]
    WrongAppSignature,

    #[error("OS version is too old")]
    OsTooOld,

    #[error("OS patch level is too old")]
    PatchTooOld,

    #[error("attestation carries no root of trust")]
    RootOfTrustMissing,

    #[error("device is not locked")]
    DeviceNotLocked,

    #[error("verified boot state is not accepted")]
    UnknownVerifiedBootState,

    #[error("verified boot key does not match a known device")]
    UnknownDevice,

    #[error("attested key was not generated on the device")]
    KeyNotGenerated,

    #[error("attested key is not bound to the app")]
    KeyNotAppBound,

    #[error("attested key is not rollback resistant")]
    KeyNotRollbackResistant,

    #[error("attestation version is too low for this device")]
    AttestationVersionTooLow,

    #[error("keymaster version is too low for this device")]
    KeymasterVersionTooLow,

    #[error("attestation security level is not hardware-backed")]
    SoftwareSecurityLevel,
}

/// Summary of a verification that passed every content policy.
#[derive(Debug, Clone)]
pub struct Verified {
    pub device_name: &'static str,
    /// 32-byte verified boot key from the root of trust
    pub verified_boot_key: Vec<u8>,
    pub os_version: i64,
    pub os_patch_level: i64,
    pub app_version: i64,
    pub is_stock: bool,
}

/// Applies all content policies to a parsed key description.
///
/// Consumes the attestation challenge as a side effect; a consumed or
/// unknown challenge fails the first check.
pub async fn apply_content_policy(
    description: &KeyDescription,
    challenges: &ChallengeStore,
) -> Result<Verified, PolicyError> {
    // 1. Challenge binding
    let challenge: [u8; 32] = description
        .attestation_challenge
        .as_slice()
        .try_into()
        .map_err(|_| PolicyError::ChallengeNotPending)?;
    if !challenges.consume(&challenge).await {
        return Err(PolicyError::ChallengeNotPending);
    }

    // 2. App identity
    let app_version = check_app_identity(&description.software_enforced)?;

    // 3. OS floors
    let tee = &description.tee_enforced;
    let os_version = tee.os_version.unwrap_or(0);
    if os_version < OS_VERSION_FLOOR {
        return Err(PolicyError::OsTooOld);
    }
    let os_patch_level = tee.os_patch_level.unwrap_or(0);
    if os_patch_level < OS_PATCH_LEVEL_FLOOR {
        return Err(PolicyError::PatchTooOld);
    }

    // 4. Root of trust
    let root = tee
        .root_of_trust
        .as_ref()
        .ok_or(PolicyError::RootOfTrustMissing)?;
    if !root.device_locked {
        return Err(PolicyError::DeviceNotLocked);
    }
    match root.verified_boot_state {
        VerifiedBootState::Verified | VerifiedBootState::SelfSigned => {}
        VerifiedBootState::Unverified | VerifiedBootState::Failed => {
            return Err(PolicyError::UnknownVerifiedBootState);
        }
    }
    let boot_key_hex = hex::encode_upper(&root.verified_boot_key);
    let device = catalog::lookup(root.verified_boot_state, &boot_key_hex)
        .ok_or(PolicyError::UnknownDevice)?;

    // 5. Key provenance
    if tee.origin != Some(KeyOrigin::Generated) {
        return Err(PolicyError::KeyNotGenerated);
    }
    if tee.all_applications {
        return Err(PolicyError::KeyNotAppBound);
    }
    if device.requires_rollback_resistance && !tee.rollback_resistant {
        return Err(PolicyError::KeyNotRollbackResistant);
    }

    // 6. Version floors from the device descriptor
    if description.attestation_version < device.min_attestation_version {
        return Err(PolicyError::AttestationVersionTooLow);
    }
    if description.keymaster_version < device.min_keymaster_version {
        return Err(PolicyError::KeymasterVersionTooLow);
    }
    if description.attestation_security_level != SecurityLevel::TrustedEnvironment
        || description.keymaster_security_level != SecurityLevel::TrustedEnvironment
    {
        return Err(PolicyError::SoftwareSecurityLevel);
    }

    Ok(Verified {
        device_name: device.display_name,
        verified_boot_key: root.verified_boot_key.clone(),
        os_version,
        os_patch_level,
        app_version,
        is_stock: device.os_variant == OsVariant::Stock,
    })
}

fn check_app_identity(software: &AuthorizationList) -> Result<i64, PolicyError> {
    let app_id = software
        .attestation_application_id
        .as_ref()
        .ok_or(PolicyError::WrongApp)?;

    let [package] = app_id.packages.as_slice() else {
        return Err(PolicyError::WrongApp);
    };
    if package.package_name != AUDITOR_PACKAGE_NAME {
        return Err(PolicyError::WrongApp);
    }
    if package.version < AUDITOR_MINIMUM_VERSION {
        return Err(PolicyError::AppTooOld);
    }

    let [digest] = app_id.signature_digests.as_slice() else {
        return Err(PolicyError::WrongAppSignature);
    };
    let digest_hex = hex::encode(digest);
    let allowed = digest_hex == RELEASE_SIGNATURE_DIGEST
        || (cfg!(debug_assertions) && digest_hex == DEBUG_SIGNATURE_DIGEST);
    if !allowed {
        return Err(PolicyError::WrongAppSignature);
    }

    Ok(package.version)
}
