//! Attempt orchestration and the scheduling loop.

use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::config::Config;
use crate::credentials::{describe_credentials, resolve_workstation_url};
use crate::login::{resume_session, LoginFlow};
use crate::notify::Notifier;
use crate::platforms::{BrowserEngine, Page};
use crate::probe::{fast_path, Prober};
use crate::record::{Milestone, Outcome, RunLog};
use crate::session::SessionStore;
use crate::workspace::ReadinessDetector;
use crate::AutomationError;

/// Renders an error followed by each of its sources.
pub fn error_chain(error: &(dyn Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

/// Runs the recovery strategies against one workstation, one browser at a time.
pub struct Orchestrator {
    engine: Arc<dyn BrowserEngine>,
    config: Config,
    store: SessionStore,
    prober: Prober,
}

impl Orchestrator {
    pub fn new(config: Config, engine: Arc<dyn BrowserEngine>) -> Result<Self, AutomationError> {
        Ok(Self {
            store: SessionStore::new(config.session_file.clone()),
            prober: Prober::new()?,
            engine,
            config,
        })
    }

    /// Replaces the probe client, e.g. with a shorter timeout.
    pub fn with_prober(mut self, prober: Prober) -> Self {
        self.prober = prober;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// One full run: direct probe first, browser attempts only when it fails.
    #[instrument(level = "info", skip_all)]
    pub async fn run_once(&self, log: &mut RunLog) -> bool {
        log.info("Starting the workstation keep-warm run");

        if fast_path(&self.prober, &self.config, &self.store, log).await {
            log.info("Workstation reachable directly, skipping browser automation");
            describe_credentials(&self.config, &self.store, log);
            return true;
        }

        let succeeded = self.run_attempts(log).await;
        log.milestone(
            Milestone::RunResult,
            if succeeded {
                Outcome::Success
            } else {
                Outcome::Failure
            },
            format!(
                "Automation result: {}",
                if succeeded { "success" } else { "failure" }
            ),
        );
        describe_credentials(&self.config, &self.store, log);
        succeeded
    }

    /// Up to `max_attempts` browser attempts. Exhaustion is reported, not raised.
    pub async fn run_attempts(&self, log: &mut RunLog) -> bool {
        let max = self.config.max_attempts.max(1);
        for attempt in 1..=max {
            log.info(format!("Attempt {attempt}/{max}"));
            match self.attempt(attempt, log).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => log.error(format!("Attempt {attempt} failed: {}", error_chain(&e))),
            }
            if attempt == max {
                log.warn("Reached the maximum number of attempts, giving up");
            } else {
                log.info("Preparing the next attempt");
            }
        }
        false
    }

    async fn attempt(&self, attempt: u32, log: &mut RunLog) -> Result<bool, AutomationError> {
        let state = self.store.load(log);
        let page = self.engine.launch(&state).await?;
        let outcome = self.drive(page.as_ref(), attempt, log).await;
        if let Err(e) = page.close().await {
            log.warn(format!("Closing the browser failed: {e}"));
        }
        outcome
    }

    async fn drive(
        &self,
        page: &dyn Page,
        attempt: u32,
        log: &mut RunLog,
    ) -> Result<bool, AutomationError> {
        let strict = self.config.strict;

        let reuse = resume_session(page, &self.config, log).await;
        if reuse.accepted(strict) {
            log.milestone(
                Milestone::SessionReuse,
                Outcome::Success,
                "Signed in with the stored session",
            );
        } else {
            log.milestone(
                Milestone::SessionReuse,
                Outcome::Failure,
                "Stored session sign-in failed, trying the UI login flow",
            );
            let login = LoginFlow::new(page, &self.config).run(log).await;
            if !login.accepted(strict) {
                log.milestone(
                    Milestone::UiLogin,
                    Outcome::Failure,
                    format!("Attempt {attempt}: UI login flow failed"),
                );
                return Ok(false);
            }
            log.milestone(Milestone::UiLogin, Outcome::Success, "UI login flow succeeded");
        }

        let readiness = ReadinessDetector::new(page, &self.config).run(log).await;
        if !readiness.accepted(strict) {
            log.milestone(
                Milestone::WorkspaceVerified,
                Outcome::Failure,
                format!("Attempt {attempt}: workspace load verification failed"),
            );
            return Ok(false);
        }
        log.milestone(
            Milestone::WorkspaceVerified,
            Outcome::Success,
            format!(
                "Workspace load verified ({:?}, {} markers)",
                readiness.certainty, readiness.markers
            ),
        );

        let state = page.storage_state().await?;
        self.store.save(&state)?;
        log.milestone(
            Milestone::SessionSaved,
            Outcome::Success,
            format!(
                "Saved the final session state to {}",
                self.store.path().display()
            ),
        );
        Ok(true)
    }
}

/// Time left to sleep after a cycle that took `elapsed`.
pub fn next_wait(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// Runs the orchestrator on a fixed interval and reports every cycle.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    cycles: u64,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, notifier: Arc<dyn Notifier>) -> Self {
        let interval = orchestrator.config().interval;
        Self {
            orchestrator,
            notifier,
            interval,
            cycles: 0,
        }
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One cycle: run, then notify exactly once. A panic inside the run is
    /// caught and reported like any other failure.
    pub async fn run_cycle(&mut self) -> RunLog {
        self.cycles += 1;
        let cycle = self.cycles;

        // Shared so the lines written before a panic still reach the report
        let shared = Arc::new(Mutex::new(RunLog::new()));
        let orchestrator = self.orchestrator.clone();
        let task = {
            let shared = shared.clone();
            tokio::spawn(async move {
                let mut log = shared.lock().await;
                log.info(format!("Cycle {cycle} started"));
                orchestrator.run_once(&mut log).await;
            })
        };

        let outcome = task.await;
        let mut log = std::mem::take(&mut *shared.lock().await);
        if let Err(e) = outcome {
            log.milestone(
                Milestone::MainFlowError,
                Outcome::Failure,
                format!("Main flow failed in cycle {cycle}: {}", error_chain(&e)),
            );
        }

        let domain = resolve_workstation_url(
            None,
            self.orchestrator.config(),
            self.orchestrator.store(),
            &mut log,
        );
        self.notifier.notify(&mut log, &domain).await;
        log
    }

    /// Cycles forever, keeping the start of consecutive cycles `interval` apart.
    pub async fn run_forever(mut self) {
        info!(interval = ?self.interval, "Scheduler started");
        loop {
            let started = Instant::now();
            self.run_cycle().await;
            let wait = next_wait(self.interval, started.elapsed());
            info!(
                cycle = self.cycles,
                wait_secs = wait.as_secs(),
                "Cycle finished, sleeping until the next one"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_never_goes_negative() {
        let interval = Duration::from_secs(30 * 60);
        assert_eq!(
            next_wait(interval, Duration::from_secs(10 * 60)),
            Duration::from_secs(20 * 60)
        );
        assert_eq!(next_wait(interval, Duration::from_secs(45 * 60)), Duration::ZERO);
        assert_eq!(next_wait(interval, interval), Duration::ZERO);
    }

    #[test]
    fn error_chain_includes_sources() {
        let err = AutomationError::Launch("no browser".into());
        assert_eq!(error_chain(&err), "Browser launch failed: no browser");

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = AutomationError::from(io);
        let rendered = error_chain(&err);
        assert!(rendered.starts_with("I/O error: disk full"));
        assert!(rendered.ends_with(": disk full"));
    }
}
