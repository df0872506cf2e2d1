use std::sync::Arc;

use tracing::info;

use crate::error::StoreError;
use crate::store::ConversationStore;
use crate::types::{ChatMessage, ChatRole, Identity};

/// Title given to sessions created on their first message.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

/// Session lifecycle and the append-only message log.
pub struct ConversationService {
    store: Arc<dyn ConversationStore>,
}

impl ConversationService {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// Idempotent session creation. An existing unowned session is
    /// claimed when the caller is signed in; ownership transitions at
    /// most once and is never reassigned.
    pub async fn ensure_session(
        &self,
        session_id: &str,
        fingerprint: &str,
        identity: &Identity,
        title: &str,
    ) -> Result<(), StoreError> {
        match self.store.session(session_id).await? {
            None => {
                self.store
                    .insert_session(session_id, fingerprint, identity.user_id(), title)
                    .await
            }
            Some(row) => {
                if let (Some(user_id), None) = (identity.user_id(), row.user_id.as_deref()) {
                    info!("Claiming guest session {} for user {}", session_id, user_id);
                    self.store.claim_session(session_id, user_id).await?;
                }
                Ok(())
            }
        }
    }

    pub async fn append_message(
        &self,
        session_id: &str,
        role: ChatRole,
        content: &str,
    ) -> Result<(), StoreError> {
        self.store.append_message(session_id, role, content).await
    }

    /// Chronological message history; `limit` selects the newest N.
    pub async fn history(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.store.history(session_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn guest() -> Identity {
        Identity::Guest {
            fingerprint: "fp1".into(),
            address: "1.1.1.1".into(),
        }
    }

    fn user(id: &str) -> Identity {
        Identity::User {
            id: id.into(),
            email: format!("{id}@example.com"),
        }
    }

    #[tokio::test]
    async fn test_ensure_session_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let sessions = ConversationService::new(store.clone());

        sessions
            .ensure_session("s1", "fp1", &guest(), DEFAULT_SESSION_TITLE)
            .await
            .unwrap();
        sessions
            .ensure_session("s1", "fp1", &guest(), "other title")
            .await
            .unwrap();

        let row = store.session("s1").await.unwrap().unwrap();
        assert_eq!(row.title, DEFAULT_SESSION_TITLE);
        assert_eq!(row.user_id, None);
    }

    #[tokio::test]
    async fn test_session_created_by_user_is_owned() {
        let store = Arc::new(MemoryStore::new());
        let sessions = ConversationService::new(store.clone());

        sessions
            .ensure_session("s1", "fp1", &user("u1"), DEFAULT_SESSION_TITLE)
            .await
            .unwrap();
        let row = store.session("s1").await.unwrap().unwrap();
        assert_eq!(row.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_guest_session_claimed_once_never_reassigned() {
        let store = Arc::new(MemoryStore::new());
        let sessions = ConversationService::new(store.clone());

        sessions
            .ensure_session("s1", "fp1", &guest(), DEFAULT_SESSION_TITLE)
            .await
            .unwrap();
        assert_eq!(store.session("s1").await.unwrap().unwrap().user_id, None);

        // First signed-in request claims the session.
        sessions
            .ensure_session("s1", "fp1", &user("u1"), DEFAULT_SESSION_TITLE)
            .await
            .unwrap();
        assert_eq!(
            store.session("s1").await.unwrap().unwrap().user_id.as_deref(),
            Some("u1")
        );

        // Re-claiming with the same user changes nothing; a different
        // user never overwrites the owner.
        for claimant in ["u1", "u2"] {
            sessions
                .ensure_session("s1", "fp1", &user(claimant), DEFAULT_SESSION_TITLE)
                .await
                .unwrap();
            assert_eq!(
                store.session("s1").await.unwrap().unwrap().user_id.as_deref(),
                Some("u1")
            );
        }
    }

    #[tokio::test]
    async fn test_round_trip_preserves_order_and_roles() {
        let store = Arc::new(MemoryStore::new());
        let sessions = ConversationService::new(store);

        sessions
            .append_message("s1", ChatRole::User, "hello")
            .await
            .unwrap();
        sessions
            .append_message("s1", ChatRole::Assistant, "hi there")
            .await
            .unwrap();

        let history = sessions.history("s1", None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, ChatRole::User);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].role, ChatRole::Assistant);
        assert_eq!(history[1].content, "hi there");
        assert!(history[0].created_at <= history[1].created_at);
    }

    #[tokio::test]
    async fn test_history_limit_returns_newest_in_order() {
        let store = Arc::new(MemoryStore::new());
        let sessions = ConversationService::new(store);

        for i in 0..12 {
            sessions
                .append_message("s1", ChatRole::User, &format!("msg {i}"))
                .await
                .unwrap();
        }

        let window = sessions.history("s1", Some(10)).await.unwrap();
        assert_eq!(window.len(), 10);
        assert_eq!(window[0].content, "msg 2");
        assert_eq!(window[9].content, "msg 11");
    }
}
