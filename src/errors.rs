use thiserror::Error;

/// Failures while decoding upstream frames or downstream request envelopes.
///
/// Upstream variants are always recovered by dropping the frame; the
/// connection stays up.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Fewer than three `|`-separated segments.
    #[error("malformed frame: expected at least 3 '|' segments, got {0}")]
    MalformedFrame(usize),

    /// The data segment carries fewer than 32 `^`-separated fields.
    #[error("insufficient fields: expected at least 32, got {0}")]
    InsufficientFields(usize),

    #[error("field '{field}' is not numeric: '{value}'")]
    NumericParseError { field: &'static str, value: String },

    /// Downstream request is not a JSON object.
    #[error("invalid request envelope: {0}")]
    InvalidEnvelope(String),
}

/// Errors surfaced by the upstream feed connector.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    /// No approval credential configured. Not retried.
    #[error("approval key is not configured; set KIS_APPROVAL_KEY")]
    MissingCredential,

    #[error("feed worker is no longer running")]
    WorkerStopped,

    #[error("upstream connection failed: {0}")]
    ConnectionFailure(String),

    #[error("upstream {0} timed out")]
    Timeout(&'static str),
}

/// Errors returned by the historical bar store and stock metadata lookup.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Stock not found with ticker: {0}")]
    NotFound(String),
}

/// Per-request failures. Each one becomes an ERROR response to the
/// requesting session only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    #[error("{0}")]
    MissingField(&'static str),

    #[error("{0}")]
    NotFound(String),

    #[error("Unknown request type: {0}")]
    UnknownRequestType(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Store(String),
}

impl From<StoreError> for RouterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => RouterError::NotFound(err.to_string()),
        }
    }
}
