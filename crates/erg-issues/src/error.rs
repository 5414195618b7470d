use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Credential env var unset. The scheduler disables the provider until
    /// it reports configured again.
    #[error("{var} environment variable not set")]
    MissingCredential { var: &'static str },

    #[error("{provider} is not configured for this repository: {detail}")]
    NotConfigured {
        provider: &'static str,
        detail: String,
    },

    #[error("{provider} API returned status {status}{hint}")]
    Status {
        provider: &'static str,
        status: u16,
        hint: String,
    },

    #[error("{provider} request failed: {source}")]
    Http {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to parse {provider} response: {detail}")]
    Parse {
        provider: &'static str,
        detail: String,
    },

    #[error("invalid issue ID {id:?}: {detail}")]
    InvalidId { id: String, detail: String },

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Exec(#[from] erg_core::ExecError),
}

impl ProviderError {
    pub fn is_missing_credential(&self) -> bool {
        matches!(self, ProviderError::MissingCredential { .. })
    }
}
