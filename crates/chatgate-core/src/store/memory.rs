use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{ChatMessage, ChatRole};

use super::{
    ChatSessionRow, ConversationStore, GuestTrackingRow, IpAbuseRow, QuotaStore, UserStatsRow,
};

/// In-memory store for tests and local development. Mirrors the
/// conditional-write semantics of the PostgREST backend.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    guests: HashMap<String, GuestTrackingRow>,
    users: HashMap<String, UserStatsRow>,
    ips: HashMap<String, IpAbuseRow>,
    sessions: HashMap<String, ChatSessionRow>,
    messages: Vec<(String, ChatMessage)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock just means a test panicked mid-write.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Flag an address as blocked, standing in for the external abuse
    /// process that owns the flag in production.
    pub fn block_address(&self, address: &str) {
        let mut inner = self.lock();
        let row = inner
            .ips
            .entry(address.to_string())
            .or_insert_with(|| IpAbuseRow {
                ip: address.to_string(),
                request_count_1h: 0,
                is_blocked: false,
                last_request_at: None,
            });
        row.is_blocked = true;
    }

    pub fn set_premium(&self, user_id: &str, premium: bool) {
        let mut inner = self.lock();
        if let Some(row) = inner.users.get_mut(user_id) {
            row.is_premium = premium;
        }
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn guest(&self, fingerprint: &str) -> Result<Option<GuestTrackingRow>, StoreError> {
        Ok(self.lock().guests.get(fingerprint).cloned())
    }

    async fn put_guest(
        &self,
        fingerprint: &str,
        expected: Option<u32>,
        count: u32,
        address: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let current = inner.guests.get(fingerprint).map(|g| g.prompt_count);
        match (expected, current) {
            (None, None) => {
                inner.guests.insert(
                    fingerprint.to_string(),
                    GuestTrackingRow {
                        fingerprint_id: fingerprint.to_string(),
                        prompt_count: count,
                        last_ip: Some(address.to_string()),
                    },
                );
                Ok(true)
            }
            (Some(n), Some(cur)) if n == cur => {
                let row = inner.guests.get_mut(fingerprint).unwrap();
                row.prompt_count = count;
                row.last_ip = Some(address.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn user(&self, user_id: &str) -> Result<Option<UserStatsRow>, StoreError> {
        Ok(self.lock().users.get(user_id).cloned())
    }

    async fn insert_user(&self, user_id: &str, seed_count: u32) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.users.contains_key(user_id) {
            return Ok(false);
        }
        inner.users.insert(
            user_id.to_string(),
            UserStatsRow {
                user_id: user_id.to_string(),
                prompt_count: seed_count,
                is_premium: false,
                email: None,
                updated_at: Some(chrono::Utc::now()),
            },
        );
        Ok(true)
    }

    async fn set_user_count(
        &self,
        user_id: &str,
        expected: u32,
        count: u32,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.users.get_mut(user_id) {
            Some(row) if row.prompt_count == expected => {
                row.prompt_count = count;
                row.updated_at = Some(chrono::Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ip_record(&self, address: &str) -> Result<Option<IpAbuseRow>, StoreError> {
        Ok(self.lock().ips.get(address).cloned())
    }

    async fn put_ip(&self, address: &str, request_count: u32) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let row = inner
            .ips
            .entry(address.to_string())
            .or_insert_with(|| IpAbuseRow {
                ip: address.to_string(),
                request_count_1h: 0,
                is_blocked: false,
                last_request_at: None,
            });
        row.request_count_1h = request_count;
        row.last_request_at = Some(chrono::Utc::now());
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn session(&self, session_id: &str) -> Result<Option<ChatSessionRow>, StoreError> {
        Ok(self.lock().sessions.get(session_id).cloned())
    }

    async fn insert_session(
        &self,
        session_id: &str,
        fingerprint: &str,
        owner: Option<&str>,
        title: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        // Duplicate insert is a no-op, matching ignore-duplicates upsert.
        inner
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| ChatSessionRow {
                session_id: session_id.to_string(),
                fingerprint_id: fingerprint.to_string(),
                user_id: owner.map(|s| s.to_string()),
                title: title.to_string(),
            });
        Ok(())
    }

    async fn claim_session(&self, session_id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(row) = inner.sessions.get_mut(session_id) {
            if row.user_id.is_none() {
                row.user_id = Some(user_id.to_string());
            }
        }
        Ok(())
    }

    async fn append_message(
        &self,
        session_id: &str,
        role: ChatRole,
        content: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.messages.push((
            session_id.to_string(),
            ChatMessage {
                role,
                content: content.to_string(),
                created_at: chrono::Utc::now(),
            },
        ));
        Ok(())
    }

    async fn history(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let inner = self.lock();
        let all: Vec<ChatMessage> = inner
            .messages
            .iter()
            .filter(|(sid, _)| sid == session_id)
            .map(|(_, m)| m.clone())
            .collect();
        match limit {
            Some(n) => {
                let start = all.len().saturating_sub(n);
                Ok(all[start..].to_vec())
            }
            None => Ok(all),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_guest_fresh_insert_then_stale_cas() {
        let store = MemoryStore::new();

        assert!(store.put_guest("fp", None, 1, "1.1.1.1").await.unwrap());
        // A second fresh insert for the same fingerprint loses.
        assert!(!store.put_guest("fp", None, 1, "1.1.1.1").await.unwrap());
        // CAS against the current count applies.
        assert!(store.put_guest("fp", Some(1), 2, "1.1.1.2").await.unwrap());
        // CAS against a stale count does not.
        assert!(!store.put_guest("fp", Some(1), 2, "1.1.1.2").await.unwrap());

        let row = store.guest("fp").await.unwrap().unwrap();
        assert_eq!(row.prompt_count, 2);
        assert_eq!(row.last_ip.as_deref(), Some("1.1.1.2"));
    }

    #[tokio::test]
    async fn test_insert_user_only_once() {
        let store = MemoryStore::new();
        assert!(store.insert_user("u1", 3).await.unwrap());
        assert!(!store.insert_user("u1", 0).await.unwrap());
        assert_eq!(store.user("u1").await.unwrap().unwrap().prompt_count, 3);
    }

    #[tokio::test]
    async fn test_set_user_count_conditional() {
        let store = MemoryStore::new();
        store.insert_user("u1", 0).await.unwrap();
        assert!(store.set_user_count("u1", 0, 1).await.unwrap());
        assert!(!store.set_user_count("u1", 0, 1).await.unwrap());
        assert_eq!(store.user("u1").await.unwrap().unwrap().prompt_count, 1);
    }

    #[tokio::test]
    async fn test_history_limit_keeps_chronological_order() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .append_message("s1", ChatRole::User, &format!("msg {i}"))
                .await
                .unwrap();
        }
        let recent = store.history("s1", Some(2)).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "msg 3");
        assert_eq!(recent[1].content, "msg 4");
    }
}
