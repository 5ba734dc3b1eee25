mod mock;
mod orchestrator_tests;

use std::path::Path;

use crate::config::{Config, LoginCredentials, Timings};
use crate::workspace::READINESS_MARKERS;
use mock::MockFrame;

pub const APP_URL: &str = "https://idx.google.com";
pub const SIGN_IN_URL: &str = "https://accounts.google.com/v3/signin/identifier";
pub const WORKSPACE_URL: &str = "https://9000-idx-sherry-1745752283749.cluster-abc.cloudworkstations.dev/";

// Initialize tracing for tests
#[allow(dead_code)]
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
        .with_target(true)
        .with_test_writer()
        .try_init();
}

/// No waits, no credentials, session file inside `dir`.
pub fn test_config(dir: &Path) -> Config {
    Config {
        app_url: APP_URL.to_string(),
        session_file: dir.join("cookie.json"),
        timings: Timings::immediate(),
        ..Config::default()
    }
}

pub fn with_credentials(mut config: Config) -> Config {
    config.login = Some(LoginCredentials {
        email: "someone@example.com".to_string(),
        password: "correct horse".to_string(),
    });
    config
}

/// First alternative of each readiness marker, in order.
pub fn marker(index: usize) -> &'static str {
    READINESS_MARKERS[index]
        .split(", ")
        .next()
        .unwrap_or(READINESS_MARKERS[index])
}

/// A frame hosting the IDE with the first `count` markers on screen.
pub fn ide_frame(count: usize) -> MockFrame {
    MockFrame {
        html: r#"<div class="codicon codicon-explorer-view-icon"></div>"#.to_string(),
        present: (0..count)
            .map(|i| crate::Selector::from(marker(i)).to_string())
            .collect(),
    }
}
