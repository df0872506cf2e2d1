/// Core error types for chatgate.
#[derive(Debug, thiserror::Error)]
pub enum ChatgateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Store URL or service key not configured")]
    MissingStoreCredentials,

    #[error("No model API key configured")]
    NoApiKey,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse store response: {0}")]
    Parse(String),

    #[error("Counter update contention: {0}")]
    Contention(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("No credential supplied")]
    MissingCredential,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Auth provider unavailable: {0}")]
    Upstream(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("No API key configured for provider")]
    NoApiKey,
}

pub type Result<T> = std::result::Result<T, ChatgateError>;
