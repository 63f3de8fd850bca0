//! Error type shared by every automation engine implementation.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    /// A navigation, element wait or response wait ran out of time.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("no element matches selector {0:?}")]
    ElementNotFound(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    /// In-page script raised an exception.
    #[error("page script failed: {0}")]
    Script(String),

    #[error("devtools protocol error: {0}")]
    Protocol(String),

    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("browser connection closed")]
    Disconnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BrowserError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Failures that point at a slow or unreachable portal rather than a
    /// changed page layout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Disconnected)
    }

    /// Errors a page raises while it is between documents, such as a
    /// destroyed execution context during a redirect.  Polling waits retry
    /// these until their deadline.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Script(_))
    }
}
