#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed endpoint or redirect URL. Never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The OS random source failed. Propagated, not retried.
    #[error("secure random source unavailable: {0}")]
    Random(String),

    /// The callback `state` parameter did not match the value issued for
    /// this flow instance, or the state was already consumed.
    #[error("state parameter mismatch: possible CSRF attack or replayed callback")]
    StateMismatch,

    /// Protocol-level validation failure (missing mandatory response
    /// fields, oversize or malformed bodies).
    #[error("{0}")]
    Protocol(String),

    /// An error reported by the authorization server itself.
    #[error("authorization server error: {}", server_error_text(.code, .description))]
    AuthorizationServer {
        code: String,
        description: Option<String>,
    },

    /// The enclosing cancellation signal fired.
    #[error("authorization canceled")]
    Canceled,

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

fn server_error_text<'a>(code: &'a str, description: &'a Option<String>) -> &'a str {
    description.as_deref().unwrap_or(code)
}

pub type Result<T> = std::result::Result<T, Error>;
