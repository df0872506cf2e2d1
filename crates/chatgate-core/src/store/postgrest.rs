use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{ConfigError, StoreError};
use crate::types::{ChatMessage, ChatRole};
use crate::util::http;

use super::{
    ChatSessionRow, ConversationStore, GuestTrackingRow, IpAbuseRow, QuotaStore, UserStatsRow,
};

/// Supabase PostgREST client for the chatgate tables.
///
/// Uses the service-role key so guest tables are writable without an
/// authenticated row-level-security context.
pub struct PostgrestStore {
    base: String,
    service_key: String,
}

#[derive(Debug, Deserialize)]
struct MessageRow {
    role: String,
    content: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl PostgrestStore {
    pub fn new(cfg: &StoreConfig) -> Result<Self, ConfigError> {
        if cfg.url.is_empty() || cfg.service_key.is_empty() {
            return Err(ConfigError::MissingStoreCredentials);
        }
        Ok(Self {
            base: format!("{}/rest/v1", cfg.url.trim_end_matches('/')),
            service_key: cfg.service_key.clone(),
        })
    }

    fn request(&self, method: Method, path_and_query: &str) -> RequestBuilder {
        http::client()
            .request(method, format!("{}/{}", self.base, path_and_query))
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn check(&self, response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(StoreError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Fetch rows matching a PostgREST filter query.
    async fn select<T: serde::de::DeserializeOwned>(
        &self,
        path_and_query: &str,
    ) -> Result<Vec<T>, StoreError> {
        let response = self.request(Method::GET, path_and_query).send().await?;
        let response = self.check(response).await?;
        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| StoreError::Parse(e.to_string()))
    }

    /// Fetch at most one row.
    async fn select_one<T: serde::de::DeserializeOwned>(
        &self,
        path_and_query: &str,
    ) -> Result<Option<T>, StoreError> {
        Ok(self.select::<T>(path_and_query).await?.into_iter().next())
    }

    /// Insert a row; a unique-key conflict reports `false` instead of
    /// failing so callers can re-read and retry.
    async fn insert_once(
        &self,
        table: &str,
        body: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let response = self
            .request(Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            debug!("insert into {} lost a creation race", table);
            return Ok(false);
        }
        self.check(response).await?;
        Ok(true)
    }

    /// Conditional update: applies only where the filter still matches.
    /// `Prefer: return=representation` makes the affected rows visible, so
    /// an empty result means the precondition no longer held.
    async fn update_where(
        &self,
        path_and_query: &str,
        body: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let response = self
            .request(Method::PATCH, path_and_query)
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await?;
        let response = self.check(response).await?;
        let rows: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| StoreError::Parse(e.to_string()))?;
        Ok(!rows.is_empty())
    }
}

fn enc(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

#[async_trait]
impl QuotaStore for PostgrestStore {
    async fn guest(&self, fingerprint: &str) -> Result<Option<GuestTrackingRow>, StoreError> {
        self.select_one(&format!(
            "guest_tracking?select=*&fingerprint_id=eq.{}",
            enc(fingerprint)
        ))
        .await
    }

    async fn put_guest(
        &self,
        fingerprint: &str,
        expected: Option<u32>,
        count: u32,
        address: &str,
    ) -> Result<bool, StoreError> {
        match expected {
            None => {
                self.insert_once(
                    "guest_tracking",
                    json!({
                        "fingerprint_id": fingerprint,
                        "prompt_count": count,
                        "last_ip": address,
                    }),
                )
                .await
            }
            Some(n) => {
                self.update_where(
                    &format!(
                        "guest_tracking?fingerprint_id=eq.{}&prompt_count=eq.{}",
                        enc(fingerprint),
                        n
                    ),
                    json!({ "prompt_count": count, "last_ip": address }),
                )
                .await
            }
        }
    }

    async fn user(&self, user_id: &str) -> Result<Option<UserStatsRow>, StoreError> {
        self.select_one(&format!("user_stats?select=*&user_id=eq.{}", enc(user_id)))
            .await
    }

    async fn insert_user(&self, user_id: &str, seed_count: u32) -> Result<bool, StoreError> {
        self.insert_once(
            "user_stats",
            json!({ "user_id": user_id, "prompt_count": seed_count }),
        )
        .await
    }

    async fn set_user_count(
        &self,
        user_id: &str,
        expected: u32,
        count: u32,
    ) -> Result<bool, StoreError> {
        self.update_where(
            &format!(
                "user_stats?user_id=eq.{}&prompt_count=eq.{}",
                enc(user_id),
                expected
            ),
            json!({
                "prompt_count": count,
                "updated_at": crate::util::timestamp(),
            }),
        )
        .await
    }

    async fn ip_record(&self, address: &str) -> Result<Option<IpAbuseRow>, StoreError> {
        self.select_one(&format!("ip_abuse_monitor?select=*&ip=eq.{}", enc(address)))
            .await
    }

    async fn put_ip(&self, address: &str, request_count: u32) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST, "ip_abuse_monitor")
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&json!({
                "ip": address,
                "request_count_1h": request_count,
                "last_request_at": crate::util::timestamp(),
            }))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for PostgrestStore {
    async fn session(&self, session_id: &str) -> Result<Option<ChatSessionRow>, StoreError> {
        self.select_one(&format!(
            "chat_sessions?select=*&session_id=eq.{}",
            enc(session_id)
        ))
        .await
    }

    async fn insert_session(
        &self,
        session_id: &str,
        fingerprint: &str,
        owner: Option<&str>,
        title: &str,
    ) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST, "chat_sessions")
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .json(&json!({
                "session_id": session_id,
                "fingerprint_id": fingerprint,
                "user_id": owner,
                "title": title,
            }))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn claim_session(&self, session_id: &str, user_id: &str) -> Result<(), StoreError> {
        // Filtered on user_id=is.null: an already-owned session matches no
        // rows and the claim is a no-op.
        self.update_where(
            &format!(
                "chat_sessions?session_id=eq.{}&user_id=is.null",
                enc(session_id)
            ),
            json!({ "user_id": user_id }),
        )
        .await?;
        Ok(())
    }

    async fn append_message(
        &self,
        session_id: &str,
        role: ChatRole,
        content: &str,
    ) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST, "chat_messages")
            .header("Prefer", "return=minimal")
            .json(&json!({
                "session_id": session_id,
                "role": role.as_str(),
                "content": content,
            }))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn history(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let rows: Vec<MessageRow> = match limit {
            // Newest N fetched descending, then flipped back to
            // chronological order for the caller.
            Some(n) => {
                let mut rows: Vec<MessageRow> = self
                    .select(&format!(
                        "chat_messages?select=role,content,created_at&session_id=eq.{}&order=created_at.desc&limit={}",
                        enc(session_id),
                        n
                    ))
                    .await?;
                rows.reverse();
                rows
            }
            None => {
                self.select(&format!(
                    "chat_messages?select=role,content,created_at&session_id=eq.{}&order=created_at.asc",
                    enc(session_id)
                ))
                .await?
            }
        };

        Ok(rows
            .into_iter()
            .map(|r| ChatMessage {
                role: ChatRole::from_db(&r.role),
                content: r.content,
                created_at: r.created_at,
            })
            .collect())
    }
}
