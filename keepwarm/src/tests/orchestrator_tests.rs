//! Attempt orchestration and scheduling with scripted browsers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::login_flow_tests::sign_in_page;
use super::mock::{MockEngine, MockPage};
use super::{ide_frame, test_config, with_credentials};
use crate::config::Config;
use crate::notify::Notifier;
use crate::orchestrator::{Orchestrator, Scheduler};
use crate::probe::Prober;
use crate::record::{Milestone, Outcome, RunLog};
use crate::session::{Cookie, SessionState, WORKSTATION_TOKEN_COOKIE};

fn token_state(token: &str) -> SessionState {
    SessionState {
        cookies: vec![Cookie::new(
            WORKSTATION_TOKEN_COOKIE,
            token,
            ".cloudworkstations.dev",
        )],
        origins: Vec::new(),
    }
}

fn orchestrator(config: Config, engine: &Arc<MockEngine>) -> Orchestrator {
    Orchestrator::new(config, engine.clone())
        .unwrap()
        .with_prober(Prober::with_timeout(Duration::from_secs(2)).unwrap())
}

fn outcome_of(log: &RunLog, milestone: Milestone) -> Vec<Outcome> {
    log.milestones()
        .filter(|(_, m, _)| *m == milestone)
        .map(|(_, _, o)| o)
        .collect()
}

/// Records every report it is asked to deliver.
#[derive(Default)]
struct RecordingNotifier {
    reports: Mutex<Vec<(String, usize)>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, log: &mut RunLog, domain: &str) {
        self.reports
            .lock()
            .unwrap()
            .push((domain.to_string(), log.milestones().count()));
    }
}

#[tokio::test]
async fn gives_up_after_three_attempts_and_closes_every_browser() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::new(|_| sign_in_page()));
    let orchestrator = orchestrator(test_config(dir.path()), &engine);

    let mut log = RunLog::new();
    assert!(!orchestrator.run_once(&mut log).await);

    assert_eq!(engine.launches(), 3);
    assert!(engine.pages().iter().all(MockPage::is_closed));
    assert!(log.contains("Attempt 3: UI login flow failed"));
    assert!(!log.contains("Attempt 4"));
    assert_eq!(outcome_of(&log, Milestone::RunResult), vec![Outcome::Failure]);
}

#[tokio::test]
async fn launch_errors_are_logged_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MockEngine::failing());
    let orchestrator = orchestrator(test_config(dir.path()), &engine);

    let mut log = RunLog::new();
    assert!(!orchestrator.run_attempts(&mut log).await);

    assert_eq!(engine.launches(), 3);
    assert!(log.contains("Attempt 1 failed: Browser launch failed: no browser available"));
}

#[tokio::test]
async fn reachable_workstation_skips_the_browser() {
    let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    let responder = std::thread::spawn(move || {
        let request = server.recv().unwrap();
        let cookie = request
            .headers()
            .iter()
            .find(|h| h.field.equiv("Cookie"))
            .map(|h| h.value.as_str().to_string());
        request
            .respond(tiny_http::Response::from_string("workspace"))
            .unwrap();
        cookie
    });

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.workstation_url = Some(format!("http://{addr}/"));
    let engine = Arc::new(MockEngine::new(|_| sign_in_page()));
    let orchestrator = orchestrator(config, &engine);
    orchestrator.store().save(&token_state("h.p.s")).unwrap();

    let mut log = RunLog::new();
    assert!(orchestrator.run_once(&mut log).await);

    assert_eq!(engine.launches(), 0);
    assert!(log.has_milestone(Milestone::DirectAccess));
    assert!(!log.has_milestone(Milestone::RunResult));
    assert_eq!(
        responder.join().unwrap().as_deref(),
        Some("WorkstationJwtPartitioned=h.p.s")
    );
}

#[tokio::test]
async fn malformed_session_is_healed_and_the_ui_login_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = with_credentials(test_config(dir.path()));
    std::fs::write(&config.session_file, r#"{"bad":"data"}"#).unwrap();

    let engine = Arc::new(MockEngine::new(|_| {
        sign_in_page()
            .with_frame(ide_frame(5))
            .with_storage(token_state("fresh.token.value"))
    }));
    let orchestrator = orchestrator(config, &engine);

    let mut log = RunLog::new();
    assert!(orchestrator.run_once(&mut log).await);

    assert_eq!(engine.launches(), 1);
    assert_eq!(engine.seeds(), vec![SessionState::empty()]);
    assert!(log.contains("is malformed"));
    assert_eq!(outcome_of(&log, Milestone::SessionReuse), vec![Outcome::Failure]);
    assert_eq!(outcome_of(&log, Milestone::UiLogin), vec![Outcome::Success]);
    assert_eq!(
        outcome_of(&log, Milestone::WorkspaceVerified),
        vec![Outcome::Success]
    );
    assert!(log.has_milestone(Milestone::SessionSaved));
    assert!(engine.pages()[0].is_closed());

    let saved = orchestrator.store().read_existing().unwrap();
    assert_eq!(saved.workstation_token(), Some("fresh.token.value"));
}

#[tokio::test]
async fn strict_mode_rejects_an_unverified_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = with_credentials(test_config(dir.path()));
    config.strict = true;
    config.max_attempts = 1;

    let engine = Arc::new(MockEngine::new(|_| sign_in_page().with_frame(ide_frame(2))));
    let orchestrator = orchestrator(config, &engine);

    let mut log = RunLog::new();
    assert!(!orchestrator.run_attempts(&mut log).await);
    assert_eq!(
        outcome_of(&log, Milestone::WorkspaceVerified),
        vec![Outcome::Failure]
    );
    assert!(!log.has_milestone(Milestone::SessionSaved));
}

#[tokio::test]
async fn each_cycle_notifies_once_and_counts() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.workstation_url = Some("https://ws.example".to_string());
    config.max_attempts = 1;

    let engine = Arc::new(MockEngine::new(|_| MockPage::at("about:blank")));
    let notifier = Arc::new(RecordingNotifier::default());
    let mut scheduler = Scheduler::new(
        Arc::new(orchestrator(config, &engine)),
        notifier.clone(),
    );

    let log = scheduler.run_cycle().await;
    assert!(log.contains("Cycle 1 started"));
    scheduler.run_cycle().await;

    assert_eq!(scheduler.cycles(), 2);
    let reports = notifier.reports.lock().unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|(domain, _)| domain == "https://ws.example"));
    assert!(reports.iter().all(|(_, milestones)| *milestones > 0));
}

#[tokio::test]
async fn a_panicking_cycle_still_reports_what_it_logged() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.workstation_url = Some("https://ws.example".to_string());

    let engine = Arc::new(MockEngine::new(|_| panic!("browser crashed")));
    let notifier = Arc::new(RecordingNotifier::default());
    let mut scheduler = Scheduler::new(
        Arc::new(orchestrator(config, &engine)),
        notifier.clone(),
    );

    let log = scheduler.run_cycle().await;
    assert!(log.contains("Cycle 1 started"));
    assert!(log.contains("Attempt 1"));
    assert_eq!(
        outcome_of(&log, Milestone::MainFlowError),
        vec![Outcome::Failure]
    );
    assert!(log.contains("Main flow failed in cycle 1"));

    let reports = notifier.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].1 >= 1);
}
