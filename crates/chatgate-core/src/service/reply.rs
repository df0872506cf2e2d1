use std::sync::Arc;

use crate::error::ChatgateError;
use crate::provider::GenerativeModel;
use crate::session::ConversationService;
use crate::types::Turn;

/// Produces the assistant reply for a session: the newest slice of the
/// conversation plus the incoming message, sent to the generative model.
pub struct ReplyService {
    conversations: Arc<ConversationService>,
    model: Arc<dyn GenerativeModel>,
    history_window: usize,
    system_instruction: Option<String>,
}

impl ReplyService {
    pub fn new(
        conversations: Arc<ConversationService>,
        model: Arc<dyn GenerativeModel>,
        history_window: usize,
        system_instruction: Option<String>,
    ) -> Self {
        Self {
            conversations,
            model,
            history_window,
            system_instruction,
        }
    }

    pub async fn reply(
        &self,
        session_id: &str,
        user_message: &str,
    ) -> Result<String, ChatgateError> {
        let history = self
            .conversations
            .history(session_id, Some(self.history_window))
            .await?;

        let mut turns: Vec<Turn> = history.iter().map(Turn::from).collect();
        turns.push(Turn::user(user_message));

        let text = self
            .model
            .generate(&turns, self.system_instruction.as_deref())
            .await?;
        Ok(text)
    }
}
