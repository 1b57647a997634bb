use thiserror::Error;

/// Core error type for volkai.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited by backend {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("backend unavailable: {provider}")]
    ProviderUnavailable { provider: String },

    #[error("upstream error from {provider}: {code} {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("stream exceeded its {limit_ms}ms ceiling")]
    Timeout { limit_ms: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChatError {
    /// Short, stable label for logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::RateLimited { .. } => "rate_limited",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ProviderError { .. } => "provider_error",
            Self::Timeout { .. } => "timeout",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }

    /// HTTP status the delivery layer should answer with when this error
    /// happens before the response has started.
    pub fn status_hint(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            _ => 500,
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, ChatError>;
