use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("The request timed out")]
    Timeout,

    #[error("Exchange temporarily unavailable (HTTP {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("Exchange rejected the request (code {code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("Exchange reported insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Exchange already holds an order with this client id: {0}")]
    DuplicateOrder(String),

    #[error("Market '{0}' is not served by this client")]
    UnsupportedMarket(String),

    #[error("Missing API credentials for signed endpoint {0}")]
    MissingCredentials(String),

    #[error("Failed to deserialize the API response: {0}")]
    Deserialization(String),

    #[error("Invalid data format from API: {0}")]
    InvalidData(String),
}

impl ApiError {
    /// Transient failures worth another attempt: network trouble, timeouts and
    /// server-side or throttling responses. Everything else describes a request the
    /// exchange will keep refusing.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ApiError::Timeout | ApiError::Unavailable { .. } => true,
            _ => false,
        }
    }
}
