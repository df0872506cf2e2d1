use std::sync::Arc;

use tracing::{debug, info};

use crate::config::LimitsConfig;
use crate::error::StoreError;
use crate::store::QuotaStore;
use crate::types::{AdmitDecision, DenyReason, Identity};

/// Bounded retries for the conditional counter writes. A conflict means
/// another request advanced the same counter between our read and write.
const CAS_RETRIES: u32 = 3;

/// Admission control over the per-identity counters.
///
/// `admit` is a combined check-and-increment: every `Allowed` result has
/// already durably bumped the relevant counter. Counters are
/// lifetime-cumulative; nothing here resets them.
pub struct LimitService {
    store: Arc<dyn QuotaStore>,
    limits: LimitsConfig,
}

impl LimitService {
    pub fn new(store: Arc<dyn QuotaStore>, limits: LimitsConfig) -> Self {
        Self { store, limits }
    }

    /// Decide whether a request may proceed, incrementing the counter it
    /// is admitted under.
    pub async fn admit(
        &self,
        fingerprint: &str,
        address: &str,
        identity: &Identity,
    ) -> Result<AdmitDecision, StoreError> {
        match identity {
            Identity::User { id, .. } => self.admit_user(id, fingerprint).await,
            Identity::Guest { .. } => self.admit_guest(fingerprint, address).await,
        }
    }

    async fn admit_user(&self, user_id: &str, fingerprint: &str) -> Result<AdmitDecision, StoreError> {
        let limit = self.limits.user_limit();

        for _ in 0..CAS_RETRIES {
            let count = match self.store.user(user_id).await? {
                Some(row) => row.prompt_count,
                None => {
                    // First sighting of this account: inherit whatever the
                    // device already used as a guest (one-time carry-over).
                    let seed = self
                        .store
                        .guest(fingerprint)
                        .await?
                        .map(|g| g.prompt_count)
                        .unwrap_or(0);
                    if !self.store.insert_user(user_id, seed).await? {
                        // Another request created the row first; re-read.
                        continue;
                    }
                    info!(
                        "Created user counter for {} seeded with {} guest prompts",
                        user_id, seed
                    );
                    seed
                }
            };

            if count >= limit {
                return Ok(AdmitDecision::Denied(DenyReason::UserLimitReached));
            }
            if self.store.set_user_count(user_id, count, count + 1).await? {
                return Ok(AdmitDecision::Allowed { count: count + 1 });
            }
            debug!("User counter CAS conflict for {}, retrying", user_id);
        }

        Err(StoreError::Contention(format!(
            "user counter for {user_id}"
        )))
    }

    async fn admit_guest(&self, fingerprint: &str, address: &str) -> Result<AdmitDecision, StoreError> {
        // Address gate first: a blocked address is refused before its
        // counter is touched and before the fingerprint is consulted.
        match self.store.ip_record(address).await? {
            Some(record) if record.is_blocked => {
                return Ok(AdmitDecision::Denied(DenyReason::IpBlocked));
            }
            Some(record) => {
                self.store
                    .put_ip(address, record.request_count_1h + 1)
                    .await?;
            }
            None => {
                self.store.put_ip(address, 1).await?;
            }
        }

        for _ in 0..CAS_RETRIES {
            let existing = self.store.guest(fingerprint).await?;
            let count = existing.as_ref().map(|g| g.prompt_count).unwrap_or(0);

            if count >= self.limits.guest_limit {
                return Ok(AdmitDecision::Denied(DenyReason::GuestLimitReached));
            }
            let expected = existing.map(|g| g.prompt_count);
            if self
                .store
                .put_guest(fingerprint, expected, count + 1, address)
                .await?
            {
                return Ok(AdmitDecision::Allowed { count: count + 1 });
            }
            debug!("Guest counter CAS conflict for {}, retrying", fingerprint);
        }

        Err(StoreError::Contention(format!(
            "guest counter for {fingerprint}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn service(store: Arc<MemoryStore>) -> LimitService {
        LimitService::new(store, LimitsConfig::default())
    }

    fn guest(fp: &str, addr: &str) -> Identity {
        Identity::Guest {
            fingerprint: fp.into(),
            address: addr.into(),
        }
    }

    fn user(id: &str) -> Identity {
        Identity::User {
            id: id.into(),
            email: format!("{id}@example.com"),
        }
    }

    #[tokio::test]
    async fn test_guest_allows_five_then_denies() {
        let store = Arc::new(MemoryStore::new());
        let limits = service(store.clone());

        for n in 1..=5 {
            let decision = limits.admit("fp1", "1.1.1.1", &guest("fp1", "1.1.1.1")).await.unwrap();
            assert_eq!(decision, AdmitDecision::Allowed { count: n });
        }
        let decision = limits.admit("fp1", "1.1.1.1", &guest("fp1", "1.1.1.1")).await.unwrap();
        assert_eq!(
            decision,
            AdmitDecision::Denied(DenyReason::GuestLimitReached)
        );
        // Denial leaves the counter where it was.
        assert_eq!(store.guest("fp1").await.unwrap().unwrap().prompt_count, 5);
    }

    #[tokio::test]
    async fn test_fresh_user_allows_eight_then_denies() {
        let store = Arc::new(MemoryStore::new());
        let limits = service(store);

        for n in 1..=8 {
            let decision = limits.admit("fp1", "1.1.1.1", &user("u1")).await.unwrap();
            assert_eq!(decision, AdmitDecision::Allowed { count: n });
        }
        let decision = limits.admit("fp1", "1.1.1.1", &user("u1")).await.unwrap();
        assert_eq!(decision, AdmitDecision::Denied(DenyReason::UserLimitReached));
    }

    #[tokio::test]
    async fn test_guest_usage_carries_over_to_new_user() {
        let store = Arc::new(MemoryStore::new());
        let limits = service(store.clone());

        for _ in 0..3 {
            limits.admit("fp1", "1.1.1.1", &guest("fp1", "1.1.1.1")).await.unwrap();
        }

        // Same device signs in as a brand-new user: counter starts at 3.
        let decision = limits.admit("fp1", "1.1.1.1", &user("u1")).await.unwrap();
        assert_eq!(decision, AdmitDecision::Allowed { count: 4 });

        for n in 5..=8 {
            let decision = limits.admit("fp1", "1.1.1.1", &user("u1")).await.unwrap();
            assert_eq!(decision, AdmitDecision::Allowed { count: n });
        }
        let decision = limits.admit("fp1", "1.1.1.1", &user("u1")).await.unwrap();
        assert_eq!(decision, AdmitDecision::Denied(DenyReason::UserLimitReached));
    }

    #[tokio::test]
    async fn test_carry_over_happens_only_once() {
        let store = Arc::new(MemoryStore::new());
        let limits = service(store.clone());

        limits.admit("fp1", "1.1.1.1", &guest("fp1", "1.1.1.1")).await.unwrap();
        limits.admit("fp1", "1.1.1.1", &user("u1")).await.unwrap();

        // More guest prompts after sign-in do not re-seed the account.
        limits.admit("fp1", "1.1.1.1", &guest("fp1", "1.1.1.1")).await.unwrap();
        let decision = limits.admit("fp1", "1.1.1.1", &user("u1")).await.unwrap();
        assert_eq!(decision, AdmitDecision::Allowed { count: 3 });
    }

    #[tokio::test]
    async fn test_blocked_address_denies_any_fingerprint() {
        let store = Arc::new(MemoryStore::new());
        store.block_address("9.9.9.9");
        let limits = service(store.clone());

        for fp in ["fp1", "fp2"] {
            let decision = limits.admit(fp, "9.9.9.9", &guest(fp, "9.9.9.9")).await.unwrap();
            assert_eq!(decision, AdmitDecision::Denied(DenyReason::IpBlocked));
        }
        // The block is checked before the abuse counter is bumped.
        let record = store.ip_record("9.9.9.9").await.unwrap().unwrap();
        assert_eq!(record.request_count_1h, 0);
        // And before the fingerprint counter is touched.
        assert!(store.guest("fp1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_block_does_not_affect_signed_in_users() {
        let store = Arc::new(MemoryStore::new());
        store.block_address("9.9.9.9");
        let limits = service(store);

        let decision = limits.admit("fp1", "9.9.9.9", &user("u1")).await.unwrap();
        assert_eq!(decision, AdmitDecision::Allowed { count: 1 });
    }

    #[tokio::test]
    async fn test_address_counter_increments_per_guest_request() {
        let store = Arc::new(MemoryStore::new());
        let limits = service(store.clone());

        limits.admit("fp1", "2.2.2.2", &guest("fp1", "2.2.2.2")).await.unwrap();
        limits.admit("fp2", "2.2.2.2", &guest("fp2", "2.2.2.2")).await.unwrap();

        let record = store.ip_record("2.2.2.2").await.unwrap().unwrap();
        assert_eq!(record.request_count_1h, 2);
        assert!(record.last_request_at.is_some());
    }

    #[tokio::test]
    async fn test_guest_counter_records_latest_address() {
        let store = Arc::new(MemoryStore::new());
        let limits = service(store.clone());

        limits.admit("fp1", "1.1.1.1", &guest("fp1", "1.1.1.1")).await.unwrap();
        limits.admit("fp1", "5.5.5.5", &guest("fp1", "5.5.5.5")).await.unwrap();

        let row = store.guest("fp1").await.unwrap().unwrap();
        assert_eq!(row.last_ip.as_deref(), Some("5.5.5.5"));
    }
}
