pub mod memory;
pub mod postgrest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::{ChatMessage, ChatRole};

/// Row of the `user_stats` table, keyed by account id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStatsRow {
    pub user_id: String,
    pub prompt_count: u32,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Row of the `guest_tracking` table, keyed by device fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestTrackingRow {
    pub fingerprint_id: String,
    pub prompt_count: u32,
    #[serde(default)]
    pub last_ip: Option<String>,
}

/// Row of the `ip_abuse_monitor` table, keyed by network address.
///
/// Blocking is flipped by an external process; this system only
/// increments the counter and honors the flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAbuseRow {
    pub ip: String,
    pub request_count_1h: u32,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub last_request_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Row of the `chat_sessions` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSessionRow {
    pub session_id: String,
    pub fingerprint_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub title: String,
}

/// Per-identity counters with conditional write primitives.
///
/// The conditional (`expected`) variants are the atomicity seam: a write
/// only applies when the stored count still matches what the caller read,
/// so check-and-increment races surface as a `false` return instead of a
/// lost update.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn guest(&self, fingerprint: &str) -> Result<Option<GuestTrackingRow>, StoreError>;

    /// Write a guest counter. `expected = None` inserts a fresh row and
    /// fails (returns `false`) if one appeared concurrently; `Some(n)`
    /// updates only while the stored count is still `n`.
    async fn put_guest(
        &self,
        fingerprint: &str,
        expected: Option<u32>,
        count: u32,
        address: &str,
    ) -> Result<bool, StoreError>;

    async fn user(&self, user_id: &str) -> Result<Option<UserStatsRow>, StoreError>;

    /// Create the user counter exactly once. Returns `false` when the row
    /// already exists (lost creation race).
    async fn insert_user(&self, user_id: &str, seed_count: u32) -> Result<bool, StoreError>;

    /// Conditional counter update; refreshes `updated_at` on success.
    async fn set_user_count(
        &self,
        user_id: &str,
        expected: u32,
        count: u32,
    ) -> Result<bool, StoreError>;

    async fn ip_record(&self, address: &str) -> Result<Option<IpAbuseRow>, StoreError>;

    /// Upsert the address abuse counter, refreshing `last_request_at`.
    async fn put_ip(&self, address: &str, request_count: u32) -> Result<(), StoreError>;
}

/// Append-only message log with one-time session ownership.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn session(&self, session_id: &str) -> Result<Option<ChatSessionRow>, StoreError>;

    /// Idempotent insert; a concurrent duplicate is not an error.
    async fn insert_session(
        &self,
        session_id: &str,
        fingerprint: &str,
        owner: Option<&str>,
        title: &str,
    ) -> Result<(), StoreError>;

    /// Set the owner only where it is currently null. A session already
    /// owned by anyone is left untouched.
    async fn claim_session(&self, session_id: &str, user_id: &str) -> Result<(), StoreError>;

    async fn append_message(
        &self,
        session_id: &str,
        role: ChatRole,
        content: &str,
    ) -> Result<(), StoreError>;

    /// Messages in chronological (ascending creation time) order. With a
    /// limit, the most recent `limit` messages, still ascending.
    async fn history(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>, StoreError>;
}
