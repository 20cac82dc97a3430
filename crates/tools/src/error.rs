#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("capability already registered: {0}")]
    DuplicateCapability(String),

    #[error("capability not found: {0}")]
    NotFound(String),

    #[error("capability {capability} requires credential {credential}, but none resolves")]
    CredentialMissing {
        capability: String,
        credential: String,
    },

    #[error("invalid params for {capability}: {reason}")]
    InvalidParams { capability: String, reason: String },

    #[error("capability {capability} failed: {source}")]
    Handler {
        capability: String,
        #[source]
        source: anyhow::Error,
    },
}

impl CapabilityError {
    pub fn invalid_params(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            capability: capability.into(),
            reason: reason.into(),
        }
    }
}
