use std::time::Duration;

/// Boxed error produced by caller-supplied hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse category of a [`StatError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Auth,
    RateLimit,
    Generic,
    Decode,
}

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum StatError {
    /// Token rejected (401) or not allowed for this service (403). Never retried.
    #[error("[{status}] {message}")]
    Auth {
        status: u16,
        message: String,
        /// Raw response body.
        body: String,
    },
    /// Rate limit still exceeded (429) once the retry budget is spent.
    #[error("[{status}] {message}")]
    RateLimit {
        status: u16,
        message: String,
        /// Parsed `Retry-After` header, when the server sent a numeric one.
        retry_after: Option<Duration>,
        /// Raw response body.
        body: String,
    },
    /// Any other failed status, a transport fault, or a failed row transform.
    #[error("{}", render(.status, .message))]
    Generic {
        /// `None` when no response was received.
        status: Option<u16>,
        message: String,
        /// Raw response body, empty for transport faults.
        body: String,
        #[source]
        source: Option<BoxError>,
    },
    /// Response body is not the expected JSON shape.
    #[error("decode error: {0}")]
    Decode(String),
}

fn render(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(status) => format!("[{status}] {message}"),
        None => message.to_owned(),
    }
}

impl StatError {
    pub(crate) fn network(err: reqwest::Error) -> Self {
        Self::Generic {
            status: None,
            message: format!("Network error: {err}"),
            body: String::new(),
            source: Some(Box::new(err)),
        }
    }

    pub(crate) fn transform(err: BoxError) -> Self {
        Self::Generic {
            status: None,
            message: format!("row transform failed: {err}"),
            body: String::new(),
            source: Some(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth { .. } => ErrorKind::Auth,
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::Generic { .. } => ErrorKind::Generic,
            Self::Decode(_) => ErrorKind::Decode,
        }
    }

    /// HTTP status of the failed response, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Auth { status, .. } | Self::RateLimit { status, .. } => Some(*status),
            Self::Generic { status, .. } => *status,
            Self::Decode(_) => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Auth { message, .. }
            | Self::RateLimit { message, .. }
            | Self::Generic { message, .. } => message,
            Self::Decode(message) => message,
        }
    }

    /// Raw response body; empty when there was none.
    pub fn body(&self) -> &str {
        match self {
            Self::Auth { body, .. } | Self::RateLimit { body, .. } | Self::Generic { body, .. } => {
                body
            }
            Self::Decode(_) => "",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
