use std::sync::Arc;

use tracing::error;

use crate::error::ChatgateError;
use crate::identity::{self, TokenVerifier};
use crate::limit::LimitService;
use crate::service::reply::ReplyService;
use crate::session::{ConversationService, DEFAULT_SESSION_TITLE};
use crate::types::{AdmitDecision, ChatRole, DenyReason};

/// One chat turn's inputs, as extracted from the HTTP request.
#[derive(Debug, Clone)]
pub struct ChatTurnRequest {
    pub message: String,
    pub session_id: String,
    pub fingerprint: String,
    pub bearer: Option<String>,
    pub address: String,
}

/// Successful turn result.
#[derive(Debug, Clone)]
pub struct ChatTurnOutcome {
    pub reply: String,
    pub prompt_count: u32,
    pub is_guest: bool,
}

/// Terminal turn failures. A denial is an expected, user-facing outcome;
/// everything else is internal.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("admission denied: {0}")]
    Denied(DenyReason),

    #[error(transparent)]
    Internal(#[from] ChatgateError),
}

/// Sequences a chat turn: resolve identity, admit against quota, ensure
/// the session, persist the user message, generate the reply, persist it.
/// Nothing is retried; a failed step ends the turn.
pub struct ChatService {
    verifier: Arc<dyn TokenVerifier>,
    limits: LimitService,
    conversations: Arc<ConversationService>,
    replies: ReplyService,
}

impl ChatService {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        limits: LimitService,
        conversations: Arc<ConversationService>,
        replies: ReplyService,
    ) -> Self {
        Self {
            verifier,
            limits,
            conversations,
            replies,
        }
    }

    pub async fn chat_turn(&self, req: ChatTurnRequest) -> Result<ChatTurnOutcome, ChatError> {
        let identity = identity::resolve(
            self.verifier.as_ref(),
            req.bearer.as_deref(),
            &req.fingerprint,
            &req.address,
        )
        .await;

        let decision = self
            .limits
            .admit(&req.fingerprint, &req.address, &identity)
            .await
            .map_err(ChatgateError::from)?;
        let prompt_count = match decision {
            AdmitDecision::Allowed { count } => count,
            AdmitDecision::Denied(reason) => return Err(ChatError::Denied(reason)),
        };

        self.conversations
            .ensure_session(
                &req.session_id,
                &req.fingerprint,
                &identity,
                DEFAULT_SESSION_TITLE,
            )
            .await
            .map_err(ChatgateError::from)?;

        self.conversations
            .append_message(&req.session_id, ChatRole::User, &req.message)
            .await
            .map_err(ChatgateError::from)?;

        let reply = self
            .replies
            .reply(&req.session_id, &req.message)
            .await
            .inspect_err(|e| error!("Reply generation failed: {}", e))?;

        self.conversations
            .append_message(&req.session_id, ChatRole::Assistant, &reply)
            .await
            .map_err(ChatgateError::from)?;

        Ok(ChatTurnOutcome {
            reply,
            prompt_count,
            is_guest: identity.is_guest(),
        })
    }
}
