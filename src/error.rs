use thiserror::Error;

/// Synthetic status for failures that never produced an HTTP response.
pub const TRANSPORT_STATUS: u16 = 500;

/// Status class reported for payloads rejected before dispatch.
pub const INPUT_STATUS: u16 = 400;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Malformed payload or missing identifier. Never sent over the wire.
    #[error("{0}")]
    InvalidInput(String),

    /// Connection failure, timeout, or an undecodable response body.
    #[error("{0}")]
    Transport(String),

    /// Any non-2xx response.
    #[error("{message}")]
    Server { status: u16, message: String },
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::InvalidInput(_) => INPUT_STATUS,
            ApiError::Transport(_) => TRANSPORT_STATUS,
            ApiError::Server { status, .. } => *status,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::InvalidInput(message)
            | ApiError::Transport(message)
            | ApiError::Server { message, .. } => message,
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == 404
    }

    /// Whether repeating the same request could plausibly succeed.
    ///
    /// Only 5xx, request timeout (408) and rate limiting (429) responses are
    /// retried. Input errors and every other status are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::InvalidInput(_) => false,
            ApiError::Transport(_) => true,
            ApiError::Server { status, .. } => *status >= 500 || *status == 408 || *status == 429,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "Request timed out".to_string()
        } else if err.is_connect() {
            "Could not connect to the API server".to_string()
        } else if err.is_decode() {
            format!("Invalid response from the API server: {}", err)
        } else {
            err.to_string()
        };
        ApiError::Transport(message)
    }
}
