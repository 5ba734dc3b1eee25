use tracing::{debug, instrument};

use crate::platforms::{ElementHandle, Frame};
use crate::record::RunLog;
use crate::selector::Selector;
use std::time::Duration;

// Default budget for one pass over all candidates
const DEFAULT_LOCATOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Ordered-fallback element lookup
///
/// Candidates are tried in order and the first match wins. One pass (a
/// "round") splits the timeout evenly between the candidates, so a round never
/// costs more than the timeout. Failed rounds are retried after a short
/// backoff until the round count is exhausted.
#[derive(Clone)]
pub struct Locator<'a> {
    frame: &'a dyn Frame,
    candidates: Vec<Selector>,
    timeout: Duration,
    rounds: u32,
    backoff: Duration,
    description: String,
}

impl<'a> Locator<'a> {
    pub fn new(frame: &'a dyn Frame, candidates: Vec<Selector>) -> Self {
        Self {
            frame,
            candidates,
            timeout: DEFAULT_LOCATOR_TIMEOUT,
            rounds: 1,
            backoff: Duration::from_secs(2),
            description: "element".to_string(),
        }
    }

    /// Human-readable name used in log lines.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the budget of one round over all candidates.
    pub fn set_default_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs the rounds and returns the first element found, logging progress.
    #[instrument(level = "debug", skip(self, log), fields(description = %self.description))]
    pub async fn first(&self, log: &mut RunLog) -> Option<ElementHandle> {
        for round in 1..=self.rounds {
            log.info(format!(
                "Waiting for {}, round {round}/{}",
                self.description, self.rounds
            ));
            if let Some(handle) = find_first(self.frame, &self.candidates, self.timeout).await {
                log.info(format!("Found {} via {}", self.description, handle.selector));
                return Some(handle);
            }
            log.info(format!(
                "No candidate matched {} in round {round}",
                self.description
            ));
            if round < self.rounds && !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff).await;
            }
        }
        log.warn(format!(
            "Gave up on {} after {} round(s), tried {}",
            self.description,
            self.rounds,
            self.selector_string()
        ));
        None
    }

    /// The candidates in lookup order, for log lines.
    pub fn selector_string(&self) -> String {
        let parts: Vec<String> = self.candidates.iter().map(|s| s.to_string()).collect();
        parts.join(" | ")
    }
}

/// One pass over `candidates`, each with an equal share of `budget`.
/// Lookup errors count as misses.
pub async fn find_first(
    frame: &dyn Frame,
    candidates: &[Selector],
    budget: Duration,
) -> Option<ElementHandle> {
    if candidates.is_empty() {
        return None;
    }
    let per_candidate = budget / candidates.len() as u32;
    for selector in candidates {
        match frame.wait_for_selector(selector, per_candidate).await {
            Ok(handle) => return Some(handle),
            Err(e) if e.is_lookup_miss() => {
                debug!(%selector, "candidate did not match");
            }
            Err(e) => {
                debug!(%selector, error = %e, "candidate lookup failed");
            }
        }
    }
    None
}
