// =============================================================================
// Feed Errors — one taxonomy for REST, signing, symbols and streaming
// =============================================================================
//
// Only `Transport` is transient. Everything else is terminal for the call that
// produced it; callers decide whether that is fatal for anything larger.
// =============================================================================

use thiserror::Error;

/// Result type for every fallible operation in the feed.
pub type FeedResult<T> = Result<T, FeedError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// Network / IO failure (connect, timeout, non-2xx status, body read).
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote body was not valid JSON.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Kraken answered with a non-empty `error` list.
    #[error("exchange error: {}", .0.join(", "))]
    Exchange(Vec<String>),

    /// JSON parsed, but there was no `result` field.
    #[error("missing 'result' field in API response")]
    MissingResultEnvelope,

    /// The API secret is not valid Base64.
    #[error("invalid base64 API secret: {0}")]
    InvalidSecretFormat(String),

    /// A request was signed with an empty URL path.
    #[error("URL path cannot be empty")]
    EmptyPath,

    /// Credentials are missing or unusable.
    #[error("authentication error: {0}")]
    Auth(String),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// A stream operation needed a live connection.
    #[error("stream not connected")]
    NotConnected,

    /// The exchange rejected a subscribe/unsubscribe request.
    #[error("{method} failed for {symbol}: {reason}")]
    SubscriptionFailed {
        method: String,
        symbol: String,
        reason: String,
    },

    /// The stream exhausted its reconnect attempts.
    #[error("stream gave up after {attempts} connection attempts")]
    GaveUp { attempts: u32 },

    /// A value was rejected at the API boundary (timeframe, depth, ...).
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

impl FeedError {
    /// Whether a retry of the same call can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
