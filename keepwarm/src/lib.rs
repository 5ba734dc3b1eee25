//! Keeps a cloud workstation signed in and its workspace warm
//!
//! Each run first probes the workstation directly with the stored token. When
//! that fails, a browser is driven over the DevTools protocol to reuse the
//! stored session or sign in through the UI, open the workspace and wait for
//! the IDE to load. The browser session is saved for the next run and every
//! run ends with a report.

pub mod config;
pub mod credentials;
pub mod errors;
pub mod locator;
pub mod login;
pub mod notify;
pub mod orchestrator;
pub mod pacing;
pub mod platforms;
pub mod probe;
pub mod record;
pub mod selector;
pub mod session;
#[cfg(test)]
mod tests;
pub mod workspace;

pub use config::{Config, Timings};
pub use errors::AutomationError;
pub use locator::Locator;
pub use notify::{Notifier, TelegramNotifier};
pub use orchestrator::{Orchestrator, Scheduler};
pub use platforms::{BrowserEngine, ChromiumEngine, ElementHandle, Frame, LoadState, Page};
pub use record::{Milestone, Outcome, RunLog};
pub use selector::Selector;
pub use session::{SessionState, SessionStore};
pub use workspace::{Certainty, Confirmation, Readiness};
