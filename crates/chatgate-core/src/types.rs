use serde::{Deserialize, Serialize};

/// Message role as persisted in the conversation store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    /// Map a stored role string. Older rows used "ai" for the assistant
    /// side; anything that is not "user" is treated as assistant.
    pub fn from_db(s: &str) -> Self {
        if s == "user" {
            ChatRole::User
        } else {
            ChatRole::Assistant
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Resolved caller identity for a request.
///
/// A `Guest` is keyed by a client-supplied device fingerprint plus the
/// observed network address; a `User` is a durable, externally
/// authenticated account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Guest { fingerprint: String, address: String },
    User { id: String, email: String },
}

impl Identity {
    pub fn is_guest(&self) -> bool {
        matches!(self, Identity::Guest { .. })
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::User { id, .. } => Some(id),
            Identity::Guest { .. } => None,
        }
    }
}

/// Why an admission request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    GuestLimitReached,
    UserLimitReached,
    IpBlocked,
}

impl DenyReason {
    /// Stable machine-readable code surfaced to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::GuestLimitReached => "GUEST_LIMIT_REACHED",
            DenyReason::UserLimitReached => "USER_LIMIT_REACHED",
            DenyReason::IpBlocked => "IP_BLOCKED",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Outcome of a quota admission check. `Allowed` means the relevant
/// counter was durably incremented as part of the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    Allowed { count: u32 },
    Denied(DenyReason),
}

/// Role of a turn in the generative model's wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Model,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Model => "model",
        }
    }
}

/// A single turn of model context.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Model,
            text: text.into(),
        }
    }
}

impl From<&ChatMessage> for Turn {
    fn from(msg: &ChatMessage) -> Self {
        match msg.role {
            ChatRole::User => Turn::user(msg.content.clone()),
            ChatRole::Assistant => Turn::model(msg.content.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serde() {
        let json = serde_json::to_string(&ChatRole::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
        let role: ChatRole = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(role, ChatRole::User);
    }

    #[test]
    fn test_role_from_db_tolerates_legacy_ai() {
        assert_eq!(ChatRole::from_db("user"), ChatRole::User);
        assert_eq!(ChatRole::from_db("assistant"), ChatRole::Assistant);
        assert_eq!(ChatRole::from_db("ai"), ChatRole::Assistant);
    }

    #[test]
    fn test_deny_reason_codes() {
        assert_eq!(DenyReason::GuestLimitReached.code(), "GUEST_LIMIT_REACHED");
        assert_eq!(DenyReason::UserLimitReached.code(), "USER_LIMIT_REACHED");
        assert_eq!(DenyReason::IpBlocked.code(), "IP_BLOCKED");

        let json = serde_json::to_string(&DenyReason::IpBlocked).unwrap();
        assert_eq!(json, "\"IP_BLOCKED\"");
    }

    #[test]
    fn test_identity_accessors() {
        let guest = Identity::Guest {
            fingerprint: "fp1".into(),
            address: "1.2.3.4".into(),
        };
        assert!(guest.is_guest());
        assert_eq!(guest.user_id(), None);

        let user = Identity::User {
            id: "u1".into(),
            email: "u1@example.com".into(),
        };
        assert!(!user.is_guest());
        assert_eq!(user.user_id(), Some("u1"));
    }

    #[test]
    fn test_turn_from_message() {
        let msg = ChatMessage {
            role: ChatRole::Assistant,
            content: "hi".into(),
            created_at: chrono::Utc::now(),
        };
        let turn = Turn::from(&msg);
        assert_eq!(turn.role, TurnRole::Model);
        assert_eq!(turn.text, "hi");
    }
}
