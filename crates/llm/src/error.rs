#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("provider {provider} unavailable: {reason}")]
    ProviderUnavailable { provider: String, reason: String },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("the master model can be updated but not removed")]
    MasterModelProtected,

    #[error("invalid conversation: {0}")]
    InvalidConversation(String),

    #[error("{provider} returned HTTP {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("invalid {provider} response: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl LlmError {
    pub fn unavailable(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_response(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            provider: provider.into(),
            reason: reason.into(),
        }
    }
}
