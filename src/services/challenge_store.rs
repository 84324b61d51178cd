//! Challenge store service
//!
//! Provides in-memory storage for attestation challenges with:
//! - 5-minute TTL (time-to-live) for challenges
//! - Single-use consumption (atomic test-and-remove)
//! - Rate limiting per IP address for issuance
//! - Background cleanup of expired challenges

use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Challenge TTL in minutes
const CHALLENGE_TTL_MINUTES: i64 = 5;

/// Rate limit: max challenges per IP per window
const RATE_LIMIT_MAX: u32 = 10;

/// Rate limit window in minutes
const RATE_LIMIT_WINDOW_MINUTES: i64 = 1;

/// Rate limit entry tracking requests per IP
#[derive(Debug, Clone)]
struct RateLimitEntry {
    /// Number of requests in the current window
    count: u32,
    /// When the current window started
    window_start: DateTime<Utc>,
}

/// Thread-safe in-memory challenge store with rate limiting.
///
/// Single-consumer semantics: a challenge can be consumed at most once
/// across all tasks.
#[derive(Debug, Default)]
pub struct ChallengeStore {
    /// Pending challenges and their expiry, indexed by value
    challenges: RwLock<HashMap<[u8; 32], DateTime<Utc>>>,
    /// Rate limit tracking per IP address
    rate_limits: RwLock<HashMap<IpAddr, RateLimitEntry>>,
}

impl ChallengeStore {
    /// Creates a new challenge store wrapped in an Arc for shared ownership
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Checks and counts an issuance request from the given IP address.
    /// Returns false once the window budget is exhausted.
    pub async fn check_rate_limit(&self, ip: IpAddr) -> bool {
        let now = Utc::now();
        let mut limits = self.rate_limits.write().await;

        let entry = limits.entry(ip).or_insert(RateLimitEntry {
            count: 0,
            window_start: now,
        });

        if now - entry.window_start > Duration::minutes(RATE_LIMIT_WINDOW_MINUTES) {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count >= RATE_LIMIT_MAX {
            return false;
        }

        entry.count += 1;
        true
    }

    /// Issues a new cryptographically random challenge.
    /// Returns the challenge bytes and their expiry timestamp.
    pub async fn issue(&self) -> ([u8; 32], DateTime<Utc>) {
        let mut challenge = [0u8; 32];
        OsRng.fill_bytes(&mut challenge);
        let expires_at = self.insert(challenge).await;
        (challenge, expires_at)
    }

    /// Registers a challenge value with the standard TTL.
    pub(crate) async fn insert(&self, challenge: [u8; 32]) -> DateTime<Utc> {
        let expires_at = Utc::now() + Duration::minutes(CHALLENGE_TTL_MINUTES);
        self.challenges.write().await.insert(challenge, expires_at);
        expires_at
    }

    /// Atomically removes a pending challenge.
    ///
    /// Returns true only if the challenge was pending and unexpired; expired
    /// or unknown challenges consume as false.
    pub async fn consume(&self, challenge: &[u8; 32]) -> bool {
        let mut challenges = self.challenges.write().await;
        match challenges.remove(challenge) {
            Some(expires_at) => Utc::now() <= expires_at,
            None => false,
        }
    }

    /// Removes all expired challenges and stale rate-limit windows.
    /// Should be called periodically via the background task.
    pub async fn cleanup_expired(&self) {
        let now = Utc::now();
        let mut challenges = self.challenges.write().await;
        let before_count = challenges.len();
        challenges.retain(|_, expires_at| *expires_at > now);
        let removed = before_count - challenges.len();
        if removed > 0 {
            tracing::debug!(removed = removed, "Cleaned up expired challenges");
        }
        drop(challenges);

        let mut rate_limits = self.rate_limits.write().await;
        rate_limits.retain(|_, entry| now - entry.window_start < Duration::minutes(5));
    }

    /// Spawns a background task that periodically cleans up expired challenges.
    /// Returns a handle that can be used to abort the task.
    pub fn spawn_cleanup_task(store: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                store.cleanup_expired().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn issued_challenge_is_32_random_bytes() {
        let store = ChallengeStore::new();
        let (first, _) = store.issue().await;
        let (second, _) = store.issue().await;
        assert_eq!(first.len(), 32);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn challenge_expires_in_5_minutes() {
        let store = ChallengeStore::new();
        let (_, expires_at) = store.issue().await;
        let diff = expires_at - Utc::now();
        assert!(diff.num_minutes() >= 4 && diff.num_minutes() <= 5);
    }

    #[tokio::test]
    async fn challenge_is_single_use() {
        let store = ChallengeStore::new();
        let (challenge, _) = store.issue().await;

        assert!(store.consume(&challenge).await);
        assert!(!store.consume(&challenge).await);
    }

    #[tokio::test]
    async fn unknown_challenge_does_not_consume() {
        let store = ChallengeStore::new();
        assert!(!store.consume(&[0u8; 32]).await);
    }

    #[tokio::test]
    async fn expired_challenge_does_not_consume() {
        let store = ChallengeStore::new();
        let (challenge, _) = store.issue().await;

        {
            let mut challenges = store.challenges.write().await;
            challenges.insert(challenge, Utc::now() - Duration::minutes(1));
        }

        assert!(!store.consume(&challenge).await);
    }

    #[tokio::test]
    async fn concurrent_consumption_succeeds_exactly_once() {
        let store = ChallengeStore::new();
        let (challenge, _) = store.issue().await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(
                async move { store.consume(&challenge).await },
            ));
        }

        let mut consumed = 0;
        for handle in handles {
            if handle.await.expect("task") {
                consumed += 1;
            }
        }
        assert_eq!(consumed, 1);
    }

    #[tokio::test]
    async fn rate_limiting_caps_issuance_per_ip() {
        let store = ChallengeStore::new();
        let ip: IpAddr = Ipv4Addr::new(192, 168, 1, 1).into();

        for _ in 0..10 {
            assert!(store.check_rate_limit(ip).await);
        }
        assert!(!store.check_rate_limit(ip).await);

        // A different IP is unaffected
        let other: IpAddr = Ipv4Addr::new(192, 168, 1, 2).into();
        assert!(store.check_rate_limit(other).await);
    }

    #[tokio::test]
    async fn cleanup_removes_expired() {
        let store = ChallengeStore::new();
        let (challenge, _) = store.issue().await;

        {
            let mut challenges = store.challenges.write().await;
            challenges.insert(challenge, Utc::now() - Duration::minutes(1));
        }

        store.cleanup_expired().await;
        assert!(!store.consume(&challenge).await);
    }
}
