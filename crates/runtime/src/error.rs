use conductor_jobs::JobError;
use conductor_llm::LlmError;
use conductor_tools::CapabilityError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("invalid directive: {0}")]
    InvalidDirective(String),

    #[error("component unavailable: {0}")]
    ComponentUnavailable(String),

    /// Only surfaced for events that require the master model; otherwise the
    /// dispatcher falls back to deterministic routing.
    #[error("master model failure: {0}")]
    MasterModelFailure(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl DispatchError {
    /// Stable name reported in error acknowledgments.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Capability(err) => match err {
                CapabilityError::DuplicateCapability(_) => "DuplicateCapability",
                CapabilityError::NotFound(_) => "NotFound",
                CapabilityError::CredentialMissing { .. } => "CredentialMissing",
                CapabilityError::InvalidParams { .. } => "InvalidParams",
                CapabilityError::Handler { .. } => "CapabilityFailed",
            },
            DispatchError::Llm(err) => match err {
                LlmError::UnsupportedProvider(_) => "UnsupportedProvider",
                LlmError::ModelNotFound(_) => "NotFound",
                LlmError::InvalidConversation(_) => "InvalidConversation",
                LlmError::MasterModelProtected => "MasterModelProtected",
                LlmError::ProviderUnavailable { .. }
                | LlmError::Http { .. }
                | LlmError::InvalidResponse { .. }
                | LlmError::Transport(_) => "ProviderUnavailable",
            },
            DispatchError::Job(err) => match err {
                JobError::NotFound(_) => "NotFound",
                JobError::InvalidJob(_) => "InvalidDirective",
                JobError::ShutDown => "ComponentUnavailable",
            },
            DispatchError::InvalidDirective(_) => "InvalidDirective",
            DispatchError::ComponentUnavailable(_) => "ComponentUnavailable",
            DispatchError::MasterModelFailure(_) => "MasterModelFailure",
            DispatchError::Panicked(_) => "Panicked",
        }
    }
}
