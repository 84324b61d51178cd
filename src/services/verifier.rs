//! Attestation verification orchestrator
//!
//! Composes codec, chain verification, extension parsing, content policy,
//! and the pinning store into the two flows: first-contact pairing and
//! pinned re-verification. The pipeline is a linear sequence of fallible
//! steps; any failure aborts the request and nothing is persisted.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::chain::{self, ChainError};
use super::challenge_store::ChallengeStore;
use super::codec::{self, DecodeError, OsEnforcedFlags};
use super::extension::{self, ExtensionError};
use super::pinning::{NewPairingRecord, PinningStore, StoreError};
use super::policy::{self, PolicyError, Verified};

/// Offset subtracted from the pinned app version in the report.
const APP_VERSION_REPORT_OFFSET: i64 = 9;

/// Verification failures, mapped to fixed operator-facing messages.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("certificate chain does not match the pinned chain")]
    ChainMismatch,

    #[error("pinned pairing data is corrupt")]
    CorruptPairingData,

    #[error("message signature does not verify")]
    SignatureInvalid,

    #[error("verified boot key changed since pairing")]
    BootKeyChanged,

    #[error("OS version downgrade detected")]
    OsVersionDowngrade,

    #[error("OS patch level downgrade detected")]
    OsPatchDowngrade,

    #[error("app version downgrade detected")]
    AppVersionDowngrade,

    #[error("no pairing record for this persistent key: the initial pairing was incomplete or the device is compromised")]
    PairingMissing,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    /// True when the verification was pinned against an existing pairing
    pub strong: bool,
    /// Rendered TEE-enforced report block
    pub tee_enforced: String,
    /// Rendered OS-enforced report block
    pub os_enforced: String,
}

impl VerificationResult {
    /// The full textual report returned to the Auditor.
    pub fn report(&self) -> String {
        format!("{}\n\n{}", self.tee_enforced, self.os_enforced)
    }
}

/// The attestation verification engine.
///
/// The trusted root, challenge store, and pinning store are fixed at
/// construction and immutable afterwards.
pub struct Verifier {
    trusted_root: Vec<u8>,
    challenges: Arc<ChallengeStore>,
    pinning: PinningStore,
}

impl Verifier {
    pub fn new(
        trusted_root: Vec<u8>,
        challenges: Arc<ChallengeStore>,
        pinning: PinningStore,
    ) -> Self {
        Self {
            trusted_root,
            challenges,
            pinning,
        }
    }

    /// Verifies a serialized attestation message.
    ///
    /// On first contact a pairing record is created; afterwards the message
    /// must verify under the pinned certificate and may never downgrade the
    /// pinned OS or app versions. The audit log is written only on success,
    /// in the same transaction as the record change.
    pub async fn verify_serialized(
        &self,
        body: &[u8],
        request_id: Uuid,
    ) -> Result<VerificationResult, VerifyError> {
        let mut message = codec::decode(body)?;
        if message.chain.len() != chain::CHAIN_LENGTH {
            return Err(ChainError::UnsupportedChainLength(message.chain.len()).into());
        }
        // Substitute the pinned root into the last slot so the identity
        // check in the chain walk compares exact DER.
        message.chain[chain::CHAIN_LENGTH - 1] = self.trusted_root.clone();

        let fingerprint = message.persistent_key_fingerprint;
        let _device_guard = self.pinning.lock_device(&fingerprint).await;

        let record = self.pinning.get(&fingerprint).await?;
        let leaf_fingerprint: [u8; 32] = Sha256::digest(&message.chain[0]).into();
        let strong = record.is_some();

        tracing::debug!(
            request_id = %request_id,
            fingerprint = %hex::encode(fingerprint),
            strong,
            "attestation message decoded"
        );

        match &record {
            Some(record) => {
                // The intermediates and the signing certificate were pinned
                // at pairing time.
                if message.chain[1] != record.pinned_certificate_1
                    || message.chain[2] != record.pinned_certificate_2
                {
                    return Err(VerifyError::ChainMismatch);
                }
                let pinned_fingerprint: [u8; 32] =
                    Sha256::digest(&record.pinned_certificate_0).into();
                if pinned_fingerprint != fingerprint {
                    return Err(VerifyError::CorruptPairingData);
                }
                chain::verify_message_signature(
                    &record.pinned_certificate_0,
                    message.signed_range,
                    message.signature,
                )
                .map_err(|_| VerifyError::SignatureInvalid)?;
            }
            None => {
                if leaf_fingerprint != fingerprint {
                    return Err(VerifyError::PairingMissing);
                }
                chain::verify_message_signature(
                    &message.chain[0],
                    message.signed_range,
                    message.signature,
                )
                .map_err(|_| VerifyError::SignatureInvalid)?;
            }
        }

        let now = Utc::now();
        chain::verify_certificate_chain(&message.chain, &self.trusted_root, now)?;

        let description = extension::parse_key_attestation_extension(&message.chain[0])?;
        let verified = policy::apply_content_policy(&description, &self.challenges).await?;

        let tee_enforced = format_tee_enforced(&verified, now);
        let os_enforced = format_os_enforced(verified.app_version, message.os_enforced_flags);
        let now_millis = now.timestamp_millis();

        match record {
            Some(record) => {
                if verified.verified_boot_key != record.pinned_verified_boot_key {
                    return Err(VerifyError::BootKeyChanged);
                }
                if verified.os_version < record.pinned_os_version {
                    return Err(VerifyError::OsVersionDowngrade);
                }
                if verified.os_patch_level < record.pinned_os_patch_level {
                    return Err(VerifyError::OsPatchDowngrade);
                }
                if verified.app_version < record.pinned_app_version {
                    return Err(VerifyError::AppVersionDowngrade);
                }

                let mut tx = self.pinning.begin().await?;
                self.pinning
                    .update_monotonic(
                        &mut tx,
                        &fingerprint,
                        verified.os_version,
                        verified.os_patch_level,
                        verified.app_version,
                        now_millis,
                    )
                    .await?;
                self.pinning
                    .append_audit(&mut tx, &fingerprint, strong, &tee_enforced, &os_enforced)
                    .await?;
                tx.commit().await.map_err(StoreError::from)?;
            }
            None => {
                let mut tx = self.pinning.begin().await?;
                self.pinning
                    .create(
                        &mut tx,
                        &NewPairingRecord {
                            fingerprint: &fingerprint,
                            certificates: [
                                &message.chain[0],
                                &message.chain[1],
                                &message.chain[2],
                            ],
                            verified_boot_key: &verified.verified_boot_key,
                            os_version: verified.os_version,
                            os_patch_level: verified.os_patch_level,
                            app_version: verified.app_version,
                            now_millis,
                        },
                    )
                    .await?;
                self.pinning
                    .append_audit(&mut tx, &fingerprint, strong, &tee_enforced, &os_enforced)
                    .await?;
                tx.commit().await.map_err(StoreError::from)?;
            }
        }

        tracing::info!(
            request_id = %request_id,
            device = verified.device_name,
            strong,
            "attestation verified"
        );

        Ok(VerificationResult {
            strong,
            tee_enforced,
            os_enforced,
        })
    }
}

/// Renders an OS version integer as `MM.NN.PP`.
fn format_os_version(os_version: i64) -> String {
    format!(
        "{:02}.{:02}.{:02}",
        os_version / 10000,
        (os_version % 10000) / 100,
        os_version % 100
    )
}

/// Renders an OS patch level integer as `YYYY-MM`.
fn format_patch_level(os_patch_level: i64) -> String {
    format!("{}-{:02}", os_patch_level / 100, os_patch_level % 100)
}

fn format_tee_enforced(verified: &Verified, now: DateTime<Utc>) -> String {
    format!(
        "Device: {}\nOS version: {}\nOS patch level: {}\nTime: {}",
        verified.device_name,
        format_os_version(verified.os_version),
        format_patch_level(verified.os_patch_level),
        now.to_rfc2822()
    )
}

fn format_os_enforced(app_version: i64, flags: OsEnforcedFlags) -> String {
    let device_admin = if flags.device_admin_non_system() {
        "yes, but only system apps"
    } else if flags.device_admin() {
        "yes, with non-system apps"
    } else {
        "no"
    };

    format!(
        "Auditor app version: {}\n\
         User profile secure: {}\n\
         Enrolled fingerprints: {}\n\
         Accessibility service(s) enabled: {}\n\
         Device administrator(s) enabled: {}\n\
         Android Debug Bridge enabled: {}\n\
         Add users from lock screen: {}\n\
         Disallow new USB peripherals when locked: {}",
        app_version - APP_VERSION_REPORT_OFFSET,
        yes_no(flags.user_profile_secure()),
        yes_no(flags.enrolled_fingerprints()),
        yes_no(flags.accessibility_enabled()),
        device_admin,
        yes_no(flags.adb_enabled()),
        yes_no(flags.add_users_when_locked()),
        yes_no(flags.deny_new_usb()),
    )
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PairingRecord;
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

    const PAIR_NEW: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/pair_new.bin"));
    const REVERIFY_OK: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/reverify_ok.bin"));
    const DOWNGRADE: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/downgrade.bin"));
    const UNLOCKED: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/unlocked.bin"));
    const WRONG_APP: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/wrong_app.bin"));
    const BOOT_KEY_CHANGED: &[u8] = include_bytes!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/boot_key_changed.bin"
    ));
    const CERT_EXPIRED: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/cert_expired.bin"));
    const ALT_OS: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/alt_os.bin"));
    const ADMIN_FLAGS: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/admin_flags.bin"));
    const TEST_ROOT: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/test_root.der"));

    struct TestContext {
        verifier: Arc<Verifier>,
        challenges: Arc<ChallengeStore>,
        pinning: PinningStore,
        pool: SqlitePool,
    }

    async fn setup() -> TestContext {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory database");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("run migrations");

        let challenges = ChallengeStore::new();
        let pinning = PinningStore::new(pool.clone());
        let verifier = Arc::new(Verifier::new(
            TEST_ROOT.to_vec(),
            challenges.clone(),
            pinning.clone(),
        ));
        TestContext {
            verifier,
            challenges,
            pinning,
            pool,
        }
    }

    async fn insert_challenge(ctx: &TestContext, index: u32) {
        let challenge: [u8; 32] =
            Sha256::digest(format!("attestation-challenge-{index}").as_bytes()).into();
        ctx.challenges.insert(challenge).await;
    }

    fn device_fingerprint(message: &[u8]) -> [u8; 32] {
        codec::decode(message)
            .expect("decode fixture")
            .persistent_key_fingerprint
    }

    async fn pinned_record(ctx: &TestContext, message: &[u8]) -> PairingRecord {
        ctx.pinning
            .get(&device_fingerprint(message))
            .await
            .expect("get record")
            .expect("record exists")
    }

    async fn audit_count(ctx: &TestContext) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM attestations")
            .fetch_one(&ctx.pool)
            .await
            .expect("count audit entries")
    }

    async fn pair(ctx: &TestContext) -> VerificationResult {
        insert_challenge(ctx, 0).await;
        ctx.verifier
            .verify_serialized(PAIR_NEW, Uuid::new_v4())
            .await
            .expect("pairing succeeds")
    }

    #[tokio::test]
    async fn pairs_a_fresh_device() {
        let ctx = setup().await;
        let result = pair(&ctx).await;

        assert!(!result.strong);
        assert!(result.tee_enforced.starts_with("Device: Pixel 2\n"));
        assert!(result.tee_enforced.contains("OS version: 08.00.00"));
        assert!(result.tee_enforced.contains("OS patch level: 2018-01"));
        assert!(result.os_enforced.contains("Auditor app version: 1\n"));
        assert!(result.os_enforced.contains("User profile secure: yes"));
        assert!(result.os_enforced.contains("Enrolled fingerprints: yes"));
        assert!(result
            .os_enforced
            .contains("Device administrator(s) enabled: no"));
        assert!(result
            .os_enforced
            .contains("Disallow new USB peripherals when locked: yes"));

        let record = pinned_record(&ctx, PAIR_NEW).await;
        assert_eq!(record.pinned_os_version, 80000);
        assert_eq!(record.pinned_os_patch_level, 201_801);
        assert_eq!(record.pinned_app_version, 10);
        assert_eq!(record.verified_time_first, record.verified_time_last);
        assert_eq!(audit_count(&ctx).await, 1);
    }

    #[tokio::test]
    async fn reverifies_a_paired_device() {
        let ctx = setup().await;
        pair(&ctx).await;

        insert_challenge(&ctx, 1).await;
        let result = ctx
            .verifier
            .verify_serialized(REVERIFY_OK, Uuid::new_v4())
            .await
            .expect("re-verification succeeds");

        assert!(result.strong);
        assert!(result.tee_enforced.contains("OS patch level: 2018-02"));

        let record = pinned_record(&ctx, PAIR_NEW).await;
        assert_eq!(record.pinned_os_patch_level, 201_802);
        assert!(record.verified_time_last >= record.verified_time_first);
        assert_eq!(audit_count(&ctx).await, 2);
    }

    #[tokio::test]
    async fn rejects_patch_level_downgrade() {
        let ctx = setup().await;
        pair(&ctx).await;

        insert_challenge(&ctx, 1).await;
        ctx.verifier
            .verify_serialized(REVERIFY_OK, Uuid::new_v4())
            .await
            .expect("re-verification succeeds");

        insert_challenge(&ctx, 3).await;
        let err = ctx
            .verifier
            .verify_serialized(DOWNGRADE, Uuid::new_v4())
            .await
            .expect_err("downgrade rejected");
        assert!(matches!(err, VerifyError::OsPatchDowngrade));

        // Record and audit log are untouched by the failed attempt.
        let record = pinned_record(&ctx, PAIR_NEW).await;
        assert_eq!(record.pinned_os_patch_level, 201_802);
        assert_eq!(audit_count(&ctx).await, 2);
    }

    #[tokio::test]
    async fn rejects_unlocked_device() {
        let ctx = setup().await;
        insert_challenge(&ctx, 4).await;
        let err = ctx
            .verifier
            .verify_serialized(UNLOCKED, Uuid::new_v4())
            .await
            .expect_err("unlocked device rejected");
        assert!(matches!(
            err,
            VerifyError::Policy(PolicyError::DeviceNotLocked)
        ));
        assert_eq!(audit_count(&ctx).await, 0);
    }

    #[tokio::test]
    async fn rejects_outdated_auditor_app() {
        let ctx = setup().await;
        insert_challenge(&ctx, 5).await;
        let err = ctx
            .verifier
            .verify_serialized(WRONG_APP, Uuid::new_v4())
            .await
            .expect_err("old app rejected");
        assert!(matches!(err, VerifyError::Policy(PolicyError::AppTooOld)));
    }

    #[tokio::test]
    async fn rejects_replayed_challenge() {
        let ctx = setup().await;
        pair(&ctx).await;

        // Same message again; the challenge was consumed by the pairing.
        let err = ctx
            .verifier
            .verify_serialized(PAIR_NEW, Uuid::new_v4())
            .await
            .expect_err("replay rejected");
        assert!(matches!(
            err,
            VerifyError::Policy(PolicyError::ChallengeNotPending)
        ));
    }

    #[tokio::test]
    async fn rejects_changed_verified_boot_key() {
        let ctx = setup().await;
        pair(&ctx).await;

        insert_challenge(&ctx, 6).await;
        let err = ctx
            .verifier
            .verify_serialized(BOOT_KEY_CHANGED, Uuid::new_v4())
            .await
            .expect_err("boot key change rejected");
        assert!(matches!(err, VerifyError::BootKeyChanged));
    }

    #[tokio::test]
    async fn rejects_pinned_intermediate_mismatch() {
        let ctx = setup().await;
        pair(&ctx).await;

        // Corrupt the pinned intermediate under the device.
        sqlx::query("UPDATE devices SET pinned_certificate_1 = X'00'")
            .execute(&ctx.pool)
            .await
            .expect("corrupt record");

        insert_challenge(&ctx, 1).await;
        let err = ctx
            .verifier
            .verify_serialized(REVERIFY_OK, Uuid::new_v4())
            .await
            .expect_err("mismatched chain rejected");
        assert!(matches!(err, VerifyError::ChainMismatch));
    }

    #[tokio::test]
    async fn rejects_corrupt_pinned_certificate() {
        let ctx = setup().await;
        pair(&ctx).await;

        // A pinned leaf that no longer hashes to the fingerprint.
        sqlx::query("UPDATE devices SET pinned_certificate_0 = X'00'")
            .execute(&ctx.pool)
            .await
            .expect("corrupt record");

        insert_challenge(&ctx, 1).await;
        let err = ctx
            .verifier
            .verify_serialized(REVERIFY_OK, Uuid::new_v4())
            .await
            .expect_err("corrupt pairing rejected");
        assert!(matches!(err, VerifyError::CorruptPairingData));
    }

    #[tokio::test]
    async fn rejects_missing_pairing_for_foreign_fingerprint() {
        let ctx = setup().await;
        // Re-verification message without any pairing on record.
        let err = ctx
            .verifier
            .verify_serialized(REVERIFY_OK, Uuid::new_v4())
            .await
            .expect_err("missing pairing rejected");
        assert!(matches!(err, VerifyError::PairingMissing));
    }

    #[tokio::test]
    async fn rejects_expired_leaf_certificate() {
        let ctx = setup().await;
        insert_challenge(&ctx, 7).await;
        let err = ctx
            .verifier
            .verify_serialized(CERT_EXPIRED, Uuid::new_v4())
            .await
            .expect_err("expired certificate rejected");
        assert!(matches!(
            err,
            VerifyError::Chain(ChainError::CertExpired { index: 0 })
        ));
    }

    #[tokio::test]
    async fn rejects_tampered_signature() {
        let ctx = setup().await;
        let mut tampered = PAIR_NEW.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        let err = ctx
            .verifier
            .verify_serialized(&tampered, Uuid::new_v4())
            .await
            .expect_err("tampered signature rejected");
        assert!(matches!(err, VerifyError::SignatureInvalid));
    }

    #[tokio::test]
    async fn pairs_alternate_os_build() {
        let ctx = setup().await;
        insert_challenge(&ctx, 8).await;
        let result = ctx
            .verifier
            .verify_serialized(ALT_OS, Uuid::new_v4())
            .await
            .expect("alternate OS pairing succeeds");
        assert!(!result.strong);
        assert!(result
            .tee_enforced
            .starts_with("Device: CopperheadOS (Pixel 2)\n"));
    }

    #[tokio::test]
    async fn renders_device_admin_composite() {
        let ctx = setup().await;
        insert_challenge(&ctx, 0).await;
        let result = ctx
            .verifier
            .verify_serialized(ADMIN_FLAGS, Uuid::new_v4())
            .await
            .expect("verification succeeds");
        assert!(result
            .os_enforced
            .contains("Device administrator(s) enabled: yes, but only system apps"));
        assert!(result.os_enforced.contains("Enrolled fingerprints: no"));
    }

    #[tokio::test]
    async fn concurrent_verifications_consume_one_challenge() {
        let ctx = setup().await;
        insert_challenge(&ctx, 0).await;

        let first = {
            let verifier = ctx.verifier.clone();
            tokio::spawn(async move { verifier.verify_serialized(PAIR_NEW, Uuid::new_v4()).await })
        };
        let second = {
            let verifier = ctx.verifier.clone();
            tokio::spawn(async move { verifier.verify_serialized(PAIR_NEW, Uuid::new_v4()).await })
        };

        let results = [
            first.await.expect("task"),
            second.await.expect("task"),
        ];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let replays = results
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(VerifyError::Policy(PolicyError::ChallengeNotPending))
                )
            })
            .count();
        assert_eq!(successes, 1);
        assert_eq!(replays, 1);
        assert_eq!(audit_count(&ctx).await, 1);
    }

    #[test]
    fn formats_os_version_and_patch_level() {
        assert_eq!(format_os_version(80000), "08.00.00");
        assert_eq!(format_os_version(81002), "08.10.02");
        assert_eq!(format_patch_level(201_801), "2018-01");
        assert_eq!(format_patch_level(202_311), "2023-11");
    }

    #[test]
    fn formats_os_enforced_flags() {
        let flags = OsEnforcedFlags::new(0b0000_1100).expect("flags");
        let text = format_os_enforced(10, flags);
        assert!(text.starts_with("Auditor app version: 1\n"));
        assert!(text.contains("Device administrator(s) enabled: yes, with non-system apps"));
        assert!(text.contains("Android Debug Bridge enabled: yes"));
        assert!(text.contains("User profile secure: no"));
    }

    #[test]
    fn report_joins_both_blocks() {
        let result = VerificationResult {
            strong: false,
            tee_enforced: "tee".to_string(),
            os_enforced: "os".to_string(),
        };
        assert_eq!(result.report(), "tee\n\nos");
    }
}
