use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutomationError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("DevTools protocol error: {0}")]
    Protocol(String),

    #[error("Browser launch failed: {0}")]
    Launch(String),

    #[error("Element is detached from DOM: {0}")]
    ElementDetached(String),

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AutomationError {
    /// Timeouts and missing elements are the expected outcome of a probe that
    /// falls through to the next strategy.
    pub fn is_lookup_miss(&self) -> bool {
        matches!(
            self,
            AutomationError::Timeout(_) | AutomationError::ElementNotFound(_)
        )
    }
}
