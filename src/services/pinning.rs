//! Device pinning store
//!
//! Durable per-device pairing records plus the append-only attestation
//! audit log, backed by SQLite through sqlx. Writers for the same device
//! are serialized through a fingerprint-keyed async mutex; the store's
//! monotonic `WHERE` guards back up the orchestrator's downgrade checks.

use sqlx::sqlite::SqlitePool;
use sqlx::{Sqlite, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::models::PairingRecord;

/// Errors surfaced by the pinning store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a pairing record already exists for this device")]
    AlreadyExists,

    #[error("attestation store is busy")]
    Busy,

    #[error("monotonic update rejected by the store")]
    MonotonicityViolated,

    #[error("attestation store failure")]
    Failure(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if let Some(code) = db.code() {
                // SQLITE_CONSTRAINT_PRIMARYKEY / SQLITE_CONSTRAINT_UNIQUE
                if code == "1555" || code == "2067" {
                    return StoreError::AlreadyExists;
                }
                // SQLITE_BUSY and friends, after the busy timeout
                if code == "5" || code == "261" || code == "517" {
                    return StoreError::Busy;
                }
            }
        }
        StoreError::Failure(err)
    }
}

/// Field bundle for creating a pairing record on first contact.
#[derive(Debug)]
pub struct NewPairingRecord<'a> {
    pub fingerprint: &'a [u8],
    /// Attestation certificate and the two intermediates, leaf first
    pub certificates: [&'a [u8]; 3],
    pub verified_boot_key: &'a [u8],
    pub os_version: i64,
    pub os_patch_level: i64,
    pub app_version: i64,
    pub now_millis: i64,
}

/// Handle to the devices/attestations tables.
#[derive(Debug, Clone)]
pub struct PinningStore {
    pool: SqlitePool,
    device_locks: Arc<Mutex<HashMap<[u8; 32], Arc<Mutex<()>>>>>,
}

impl PinningStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            device_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquires the per-device lock.
    ///
    /// Concurrent verifications of the same fingerprint serialize on this
    /// guard for their whole get/check/update span.
    pub async fn lock_device(&self, fingerprint: &[u8; 32]) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.device_locks.lock().await;
            locks
                .entry(*fingerprint)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Begins a transaction for a create/update plus its audit append.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    /// Fetches the pairing record for a fingerprint, if any.
    pub async fn get(&self, fingerprint: &[u8]) -> Result<Option<PairingRecord>, StoreError> {
        let record = sqlx::query_as::<_, PairingRecord>(
            "SELECT fingerprint, pinned_certificate_0, pinned_certificate_1, \
             pinned_certificate_2, pinned_verified_boot_key, pinned_os_version, \
             pinned_os_patch_level, pinned_app_version, verified_time_first, \
             verified_time_last FROM devices WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Inserts a fresh pairing record. Fails with `AlreadyExists` if the
    /// fingerprint is already paired.
    pub async fn create(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        record: &NewPairingRecord<'_>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO devices (fingerprint, pinned_certificate_0, \
             pinned_certificate_1, pinned_certificate_2, pinned_verified_boot_key, \
             pinned_os_version, pinned_os_patch_level, pinned_app_version, \
             verified_time_first, verified_time_last) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.fingerprint)
        .bind(record.certificates[0])
        .bind(record.certificates[1])
        .bind(record.certificates[2])
        .bind(record.verified_boot_key)
        .bind(record.os_version)
        .bind(record.os_patch_level)
        .bind(record.app_version)
        .bind(record.now_millis)
        .bind(record.now_millis)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Advances the monotonic fields of an existing record.
    ///
    /// The caller has already compared against the pinned values; the WHERE
    /// guards re-assert monotonicity as a safety net.
    pub async fn update_monotonic(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        fingerprint: &[u8],
        os_version: i64,
        os_patch_level: i64,
        app_version: i64,
        now_millis: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE devices SET pinned_os_version = ?1, pinned_os_patch_level = ?2, \
             pinned_app_version = ?3, verified_time_last = ?4 \
             WHERE fingerprint = ?5 AND pinned_os_version <= ?1 \
             AND pinned_os_patch_level <= ?2 AND pinned_app_version <= ?3",
        )
        .bind(os_version)
        .bind(os_patch_level)
        .bind(app_version)
        .bind(now_millis)
        .bind(fingerprint)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MonotonicityViolated);
        }
        Ok(())
    }

    /// Appends one audit log entry.
    pub async fn append_audit(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        fingerprint: &[u8],
        strong: bool,
        tee_enforced: &str,
        os_enforced: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO attestations (fingerprint, strong, tee_enforced, os_enforced) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(fingerprint)
        .bind(strong)
        .bind(tee_enforced)
        .bind(os_enforced)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
