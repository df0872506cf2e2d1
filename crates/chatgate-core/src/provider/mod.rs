pub mod gemini;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::types::Turn;

pub use gemini::GeminiProvider;

/// External generative-text API accepting a turn-structured history and
/// returning a text reply.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn generate(
        &self,
        turns: &[Turn],
        system_instruction: Option<&str>,
    ) -> Result<String, ProviderError>;
}
