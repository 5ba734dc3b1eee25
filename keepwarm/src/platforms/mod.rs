use crate::session::SessionState;
use crate::{AutomationError, Selector};
use std::time::{Duration, Instant};

pub mod chromium;

/// Interval between lookups while waiting for a selector
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Page lifecycle milestones that can be awaited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    DomContentLoaded,
    Load,
    /// No network requests in flight for a short quiet period
    NetworkIdle,
}

/// Opaque reference to an element found on a page or frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    pub id: String,
    /// Execution context of the frame the element lives in; `None` is the main frame.
    pub context: Option<i64>,
    pub selector: Selector,
}

/// A document that can be searched: the top-level page or one of its frames.
#[async_trait::async_trait]
pub trait Frame: Send + Sync {
    /// Full serialized HTML of the document
    async fn content(&self) -> Result<String, AutomationError>;

    /// Looks the selector up once and returns the first visible match.
    async fn query(&self, selector: &Selector) -> Result<Option<ElementHandle>, AutomationError>;

    /// Polls [`Frame::query`] until a match appears or the timeout elapses.
    /// The lookup always runs at least once, so a zero timeout is a single probe.
    async fn wait_for_selector(
        &self,
        selector: &Selector,
        timeout: Duration,
    ) -> Result<ElementHandle, AutomationError> {
        if !selector.is_valid() {
            return Err(AutomationError::InvalidSelector(selector.to_string()));
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(handle) = self.query(selector).await? {
                return Ok(handle);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AutomationError::Timeout(format!(
                    "Timed out after {timeout:?} waiting for {selector}"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

/// One browser tab driven by the automation.
#[async_trait::async_trait]
pub trait Page: Frame {
    /// The top-level document as a searchable frame.
    fn as_frame(&self) -> &dyn Frame;

    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), AutomationError>;

    /// Current address of the top-level document
    async fn url(&self) -> Result<String, AutomationError>;

    async fn reload(&self) -> Result<(), AutomationError>;

    async fn wait_for_load_state(
        &self,
        state: LoadState,
        timeout: Duration,
    ) -> Result<(), AutomationError>;

    /// Child frames, depth-first. The top-level document is not included.
    async fn frames(&self) -> Result<Vec<Box<dyn Frame>>, AutomationError>;

    /// Trusted mouse click at the element's centre.
    async fn click(&self, element: &ElementHandle) -> Result<(), AutomationError>;

    /// `element.click()` from script; bypasses overlays and hit-testing.
    async fn js_click(&self, element: &ElementHandle) -> Result<(), AutomationError>;

    async fn hover(&self, element: &ElementHandle) -> Result<(), AutomationError>;

    async fn focus(&self, element: &ElementHandle) -> Result<(), AutomationError>;

    /// Presses a key chord such as `Enter`, `Delete` or `Control+a` in the element.
    async fn press(&self, element: &ElementHandle, key: &str) -> Result<(), AutomationError>;

    /// Types text one character at a time with `delay` between keystrokes.
    async fn type_text(
        &self,
        element: &ElementHandle,
        text: &str,
        delay: Duration,
    ) -> Result<(), AutomationError>;

    /// Replaces the element's value in one operation.
    async fn fill(&self, element: &ElementHandle, text: &str) -> Result<(), AutomationError>;

    /// Cookies and local storage of the browser context.
    async fn storage_state(&self) -> Result<SessionState, AutomationError>;

    /// Closes the browser owning this page. Safe to call more than once.
    async fn close(&self) -> Result<(), AutomationError>;
}

/// Launches browsers. Each call yields a fresh, isolated browser with one page.
#[async_trait::async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn launch(&self, state: &SessionState) -> Result<Box<dyn Page>, AutomationError>;
}

pub use chromium::ChromiumEngine;
