use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("page script failed: {0}")]
    Script(String),
    #[error("session already closed")]
    Closed,
}

impl BrowserError {
    /// Absence of an element is expected during best-effort steps.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrowserError::NotFound(_) | BrowserError::Timeout(_))
    }
}
