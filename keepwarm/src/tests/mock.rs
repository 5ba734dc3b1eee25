//! Scripted in-memory page and engine.
//!
//! A selector matches when its display form is in the `present` set; an `Any`
//! matches when one of its alternatives does. Reads (`query`, `url`, frames)
//! are not recorded, every interaction is.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::platforms::{BrowserEngine, ElementHandle, Frame, LoadState, Page};
use crate::session::SessionState;
use crate::{AutomationError, Selector};

#[derive(Debug, Default)]
pub struct MockState {
    pub url: String,
    pub present: HashSet<String>,
    /// goto target -> address the page ends up on
    pub redirects: HashMap<String, String>,
    /// clicked selector -> address after the click
    pub click_targets: HashMap<String, String>,
    pub reload_url: Option<String>,
    pub frames: Vec<MockFrame>,
    pub storage: SessionState,
    pub actions: Vec<String>,
    pub fail_goto: bool,
    pub closed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockFrame {
    pub html: String,
    pub present: HashSet<String>,
}

fn matching(present: &HashSet<String>, selector: &Selector) -> Option<Selector> {
    match selector {
        Selector::Any { alternatives } => alternatives.iter().find_map(|a| matching(present, a)),
        other => present.contains(&other.to_string()).then(|| other.clone()),
    }
}

fn handle_for(present: &HashSet<String>, selector: &Selector) -> Option<ElementHandle> {
    matching(present, selector).map(|matched| ElementHandle {
        id: matched.to_string(),
        context: None,
        selector: matched,
    })
}

#[async_trait::async_trait]
impl Frame for MockFrame {
    async fn content(&self) -> Result<String, AutomationError> {
        Ok(self.html.clone())
    }

    async fn query(&self, selector: &Selector) -> Result<Option<ElementHandle>, AutomationError> {
        Ok(handle_for(&self.present, selector))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockPage {
    state: Arc<Mutex<MockState>>,
}

impl MockPage {
    pub fn at(url: &str) -> Self {
        let page = Self::default();
        page.state().url = url.to_string();
        page
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn with_present(self, selectors: &[&str]) -> Self {
        self.state()
            .present
            .extend(selectors.iter().map(|s| Selector::from(*s).to_string()));
        self
    }

    pub fn with_redirect(self, from: &str, to: &str) -> Self {
        self.state().redirects.insert(from.to_string(), to.to_string());
        self
    }

    pub fn with_click_target(self, selector: &str, url: &str) -> Self {
        self.state()
            .click_targets
            .insert(Selector::from(selector).to_string(), url.to_string());
        self
    }

    pub fn with_frame(self, frame: MockFrame) -> Self {
        self.state().frames.push(frame);
        self
    }

    pub fn with_storage(self, storage: SessionState) -> Self {
        self.state().storage = storage;
        self
    }

    pub fn actions(&self) -> Vec<String> {
        self.state().actions.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn record(&self, action: String) {
        self.state().actions.push(action);
    }
}

#[async_trait::async_trait]
impl Frame for MockPage {
    async fn content(&self) -> Result<String, AutomationError> {
        Ok("<html><body></body></html>".to_string())
    }

    async fn query(&self, selector: &Selector) -> Result<Option<ElementHandle>, AutomationError> {
        Ok(handle_for(&self.state().present, selector))
    }
}

#[async_trait::async_trait]
impl Page for MockPage {
    fn as_frame(&self) -> &dyn Frame {
        self
    }

    async fn goto(&self, url: &str, _timeout: Duration) -> Result<(), AutomationError> {
        self.record(format!("goto {url}"));
        let mut state = self.state();
        if state.fail_goto {
            return Err(AutomationError::Navigation(format!("{url} unreachable")));
        }
        state.url = state
            .redirects
            .get(url)
            .cloned()
            .unwrap_or_else(|| url.to_string());
        Ok(())
    }

    async fn url(&self) -> Result<String, AutomationError> {
        Ok(self.state().url.clone())
    }

    async fn reload(&self) -> Result<(), AutomationError> {
        self.record("reload".to_string());
        let mut state = self.state();
        if let Some(url) = state.reload_url.clone() {
            state.url = url;
        }
        Ok(())
    }

    async fn wait_for_load_state(
        &self,
        _state: LoadState,
        _timeout: Duration,
    ) -> Result<(), AutomationError> {
        Ok(())
    }

    async fn frames(&self) -> Result<Vec<Box<dyn Frame>>, AutomationError> {
        Ok(self
            .state()
            .frames
            .iter()
            .cloned()
            .map(|f| Box::new(f) as Box<dyn Frame>)
            .collect())
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), AutomationError> {
        self.record(format!("click {}", element.id));
        let mut state = self.state();
        if let Some(url) = state.click_targets.get(&element.id).cloned() {
            state.url = url;
        }
        Ok(())
    }

    async fn js_click(&self, element: &ElementHandle) -> Result<(), AutomationError> {
        self.click(element).await
    }

    async fn hover(&self, element: &ElementHandle) -> Result<(), AutomationError> {
        self.record(format!("hover {}", element.id));
        Ok(())
    }

    async fn focus(&self, element: &ElementHandle) -> Result<(), AutomationError> {
        self.record(format!("focus {}", element.id));
        Ok(())
    }

    async fn press(&self, element: &ElementHandle, key: &str) -> Result<(), AutomationError> {
        self.record(format!("press {key} in {}", element.id));
        Ok(())
    }

    async fn type_text(
        &self,
        element: &ElementHandle,
        text: &str,
        _delay: Duration,
    ) -> Result<(), AutomationError> {
        self.record(format!("type {text} in {}", element.id));
        Ok(())
    }

    async fn fill(&self, element: &ElementHandle, text: &str) -> Result<(), AutomationError> {
        self.record(format!("fill {text} in {}", element.id));
        Ok(())
    }

    async fn storage_state(&self) -> Result<SessionState, AutomationError> {
        Ok(self.state().storage.clone())
    }

    async fn close(&self) -> Result<(), AutomationError> {
        self.state().closed = true;
        Ok(())
    }
}

type PageFactory = Box<dyn Fn(&SessionState) -> MockPage + Send + Sync>;

/// Hands out scripted pages and remembers every launch.
pub struct MockEngine {
    factory: PageFactory,
    launched: Mutex<Vec<(SessionState, MockPage)>>,
    fail_launch: bool,
}

impl MockEngine {
    pub fn new(factory: impl Fn(&SessionState) -> MockPage + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            launched: Mutex::new(Vec::new()),
            fail_launch: false,
        }
    }

    /// An engine whose launches always fail.
    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Self::new(|_| MockPage::default())
        }
    }

    pub fn launches(&self) -> usize {
        self.launched.lock().unwrap().len()
    }

    pub fn pages(&self) -> Vec<MockPage> {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .map(|(_, page)| page.clone())
            .collect()
    }

    /// Session states the browsers were seeded with, in launch order.
    pub fn seeds(&self) -> Vec<SessionState> {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .map(|(seed, _)| seed.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl BrowserEngine for MockEngine {
    async fn launch(&self, state: &SessionState) -> Result<Box<dyn Page>, AutomationError> {
        if self.fail_launch {
            self.launched
                .lock()
                .unwrap()
                .push((state.clone(), MockPage::default()));
            return Err(AutomationError::Launch("no browser available".to_string()));
        }
        let page = (self.factory)(state);
        self.launched
            .lock()
            .unwrap()
            .push((state.clone(), page.clone()));
        Ok(Box::new(page))
    }
}
