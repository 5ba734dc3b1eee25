//! Chromium driven over the DevTools protocol.
//!
//! Every launch gets a throwaway profile directory, a random user agent and a
//! random window size. The stored session is injected before the first
//! navigation: cookies through the network domain and local storage through a
//! script that runs ahead of every document.

mod cdp_client;
mod page;

pub use cdp_client::{CdpConnection, CdpEvent, DevToolsEndpoint, TabInfo};
pub use page::{ChromiumFrame, ChromiumPage};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde_json::json;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use crate::config::BrowserOptions;
use crate::platforms::{BrowserEngine, Page};
use crate::session::SessionState;
use crate::AutomationError;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
];

const WINDOW_SIZES: &[(u32, u32)] = &[(1920, 1080), (1366, 768), (1536, 864), (1440, 900)];

/// Binaries searched on `PATH` when no executable is configured
const BINARY_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
];

const WELL_KNOWN_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "C:\\Program Files\\Google\\Chrome\\Application\\chrome.exe",
    "C:\\Program Files (x86)\\Google\\Chrome\\Application\\chrome.exe",
];

const STARTUP_TIMEOUT: Duration = Duration::from_secs(20);
const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default)]
pub struct ChromiumEngine {
    options: BrowserOptions,
}

impl ChromiumEngine {
    pub fn new(options: BrowserOptions) -> Self {
        Self { options }
    }

    fn candidates(&self) -> Vec<PathBuf> {
        match &self.options.executable {
            Some(explicit) => vec![explicit.clone()],
            None => discover_executables(),
        }
    }

    fn arguments(&self, profile: &Path) -> Vec<String> {
        let mut rng = rand::thread_rng();
        let user_agent = USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0]);
        let (width, height) = WINDOW_SIZES.choose(&mut rng).copied().unwrap_or((1920, 1080));

        let mut args = vec![
            "--remote-debugging-port=0".to_string(),
            format!("--user-data-dir={}", profile.display()),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--disable-features=IsolateOrigins,site-per-process".to_string(),
            format!("--user-agent={user_agent}"),
            format!("--window-size={width},{height}"),
        ];
        if self.options.headless {
            args.push("--headless=new".to_string());
            args.push("--disable-gpu".to_string());
        }
        if !self.options.sandbox {
            args.push("--no-sandbox".to_string());
        }
        args.push("about:blank".to_string());
        args
    }

    fn spawn(&self, args: &[String]) -> Result<Child, AutomationError> {
        let mut last_error = None;
        for candidate in self.candidates() {
            let mut cmd = Command::new(&candidate);
            cmd.args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            match cmd.spawn() {
                Ok(child) => {
                    info!(executable = %candidate.display(), "Launched browser");
                    return Ok(child);
                }
                Err(e) => last_error = Some(format!("{}: {e}", candidate.display())),
            }
        }
        Err(AutomationError::Launch(format!(
            "failed to launch browser: {}",
            last_error.unwrap_or_else(|| "no Chromium or Chrome executable found".to_string())
        )))
    }

    async fn restore(
        &self,
        conn: &CdpConnection,
        state: &SessionState,
    ) -> Result<(), AutomationError> {
        for domain in ["Page.enable", "Network.enable", "Runtime.enable"] {
            conn.call(domain, json!({}), SETUP_TIMEOUT).await?;
        }

        let cookies: Vec<_> = state.cookies.iter().filter_map(page::cookie_to_cdp).collect();
        if !cookies.is_empty() {
            debug!(count = cookies.len(), "Restoring cookies");
            conn.call("Network.setCookies", json!({ "cookies": cookies }), SETUP_TIMEOUT)
                .await?;
        }

        for origin in &state.origins {
            let source = page::local_storage_seed(origin)?;
            conn.call(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": source }),
                SETUP_TIMEOUT,
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrowserEngine for ChromiumEngine {
    #[instrument(level = "debug", skip_all, fields(cookies = state.cookies.len()))]
    async fn launch(&self, state: &SessionState) -> Result<Box<dyn Page>, AutomationError> {
        let profile = tempfile::Builder::new().prefix("keepwarm-profile-").tempdir()?;
        let args = self.arguments(profile.path());
        let mut child = self.spawn(&args)?;

        let port = match wait_for_devtools_port(profile.path(), &mut child).await {
            Ok(port) => port,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };
        debug!(port, "DevTools listening");

        let endpoint = DevToolsEndpoint::new(port);
        let connected = async {
            if !endpoint.is_available().await {
                return Err(AutomationError::Launch(format!(
                    "DevTools port {port} does not answer"
                )));
            }
            let ws_url = endpoint.page_websocket_url().await?;
            let conn = CdpConnection::connect(&ws_url).await?;
            self.restore(&conn, state).await?;
            Ok::<_, AutomationError>(conn)
        }
        .await;
        let conn = match connected {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };

        Ok(Box::new(ChromiumPage::new(
            conn,
            child,
            profile,
            state.origins.clone(),
        )))
    }
}

/// Reads the port Chromium writes to `DevToolsActivePort` in its profile.
async fn wait_for_devtools_port(profile: &Path, child: &mut Child) -> Result<u16, AutomationError> {
    let marker = profile.join("DevToolsActivePort");
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    loop {
        if let Ok(raw) = tokio::fs::read_to_string(&marker).await {
            if let Some(port) = parse_active_port(&raw) {
                return Ok(port);
            }
        }
        if let Ok(Some(status)) = child.try_wait() {
            return Err(AutomationError::Launch(format!(
                "browser exited during startup with {status}"
            )));
        }
        if Instant::now() >= deadline {
            return Err(AutomationError::Launch(format!(
                "browser did not open a DevTools port within {STARTUP_TIMEOUT:?}"
            )));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// The first line of `DevToolsActivePort` holds the port number.
fn parse_active_port(raw: &str) -> Option<u16> {
    raw.lines().next()?.trim().parse().ok().filter(|p| *p != 0)
}

fn discover_executables() -> Vec<PathBuf> {
    let mut found = Vec::new();
    if let Some(path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path) {
            for name in BINARY_CANDIDATES {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    found.push(candidate);
                }
            }
        }
    }
    found.extend(
        WELL_KNOWN_PATHS
            .iter()
            .map(PathBuf::from)
            .filter(|p| p.is_file()),
    );
    if found.is_empty() {
        warn!("No Chromium or Chrome executable found on PATH; set CHROME_PATH");
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_port_file_is_parsed() {
        assert_eq!(parse_active_port("45123\n/devtools/browser/abc\n"), Some(45123));
        assert_eq!(parse_active_port(""), None);
        assert_eq!(parse_active_port("0\n"), None);
        assert_eq!(parse_active_port("nope"), None);
    }

    #[test]
    fn sandbox_and_headless_flags_follow_options() {
        let engine = ChromiumEngine::new(BrowserOptions {
            executable: Some(PathBuf::from("/bin/false")),
            headless: true,
            sandbox: false,
        });
        let args = engine.arguments(Path::new("/tmp/profile"));
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(args.iter().any(|a| a.starts_with("--user-agent=")));

        let headed = ChromiumEngine::new(BrowserOptions {
            headless: false,
            ..BrowserOptions::default()
        });
        let args = headed.arguments(Path::new("/tmp/profile"));
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
        assert!(!args.contains(&"--no-sandbox".to_string()));
    }

    #[test]
    fn explicit_executable_is_the_only_candidate() {
        let engine = ChromiumEngine::new(BrowserOptions {
            executable: Some(PathBuf::from("/opt/chrome")),
            ..BrowserOptions::default()
        });
        assert_eq!(engine.candidates(), vec![PathBuf::from("/opt/chrome")]);
    }
}
