//! Runtime configuration.
//!
//! Everything is optional and falls back to a documented default, except the
//! login credentials: without them the interactive login flow refuses to run,
//! while the probe and session-reuse paths keep working.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_BASE_PREFIX: &str = "9000-idx-sherry-";
pub const DEFAULT_APP_URL: &str = "https://idx.google.com";
pub const DEFAULT_SESSION_FILE: &str = "cookie.json";
pub const DEFAULT_INTERVAL_MINUTES: u64 = 30;
pub const MIN_INTERVAL_MINUTES: u64 = 5;
pub const MAX_ATTEMPTS: u32 = 3;

/// Identity provider entry point used when the app's own sign-in button
/// cannot be found.
pub const ACCOUNTS_URL: &str = "https://accounts.google.com/";

pub const ENV_BASE_PREFIX: &str = "BASE_PREFIX";
pub const ENV_APP_URL: &str = "APP_URL";
pub const ENV_TG_TOKEN: &str = "TG_TOKEN";
pub const ENV_TG_CHAT_ID: &str = "TG_CHAT_ID";
pub const ENV_EMAIL: &str = "IDX_EMAIL";
pub const ENV_PASSWORD: &str = "IDX_PASSWORD";
pub const ENV_INTERVAL_MINUTES: &str = "IDX_INTERVAL_MINUTES";
pub const ENV_SESSION_FILE: &str = "KEEPWARM_SESSION_FILE";
pub const ENV_WORKSTATION_URL: &str = "KEEPWARM_WORKSTATION_URL";
pub const ENV_STRICT: &str = "KEEPWARM_STRICT";
pub const ENV_CHROME_PATH: &str = "CHROME_PATH";
pub const ENV_HEADLESS: &str = "KEEPWARM_HEADLESS";
pub const ENV_NO_SANDBOX: &str = "KEEPWARM_NO_SANDBOX";

#[derive(Clone, PartialEq, Eq)]
pub struct LoginCredentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("email", &mask(&self.email, 3))
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct TelegramCredentials {
    pub bot_token: String,
    pub chat_id: String,
}

impl fmt::Debug for TelegramCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramCredentials")
            .field("bot_token", &mask(&self.bot_token, 5))
            .field("chat_id", &mask(&self.chat_id, 3))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Explicit Chromium/Chrome binary; discovered on `PATH` when unset.
    pub executable: Option<PathBuf>,
    pub headless: bool,
    /// Chromium refuses to start sandboxed as root inside most containers.
    pub sandbox: bool,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            sandbox: true,
        }
    }
}

/// Fixed waits used by the login, navigation and readiness stages.
#[derive(Debug, Clone)]
pub struct Timings {
    pub navigation_timeout: Duration,
    /// Pause after the first navigation to the app.
    pub entry_settle: Duration,
    /// Pause after opening the sign-in page.
    pub sign_in_settle: Duration,
    /// Short pause after page transitions that need no further checks.
    pub page_settle: Duration,
    pub branch_timeout: Duration,
    pub network_idle_timeout: Duration,
    pub dom_ready_timeout: Duration,
    pub workspace_network_idle_timeout: Duration,
    pub url_poll_interval: Duration,
    pub icon_timeout: Duration,
    /// Client-side bootstrap time granted to the workspace UI.
    pub bootstrap_pause: Duration,
    pub marker_timeout: Duration,
    pub reload_settle: Duration,
    pub full_ready_linger: Duration,
    /// Pause between rounds of an ordered selector list.
    pub retry_backoff: Duration,
    /// Multiplier for the randomized human pacing; `0.0` disables it.
    pub pacing_scale: f64,
    /// Multiplier for the fixed selector budgets of the login flow.
    pub lookup_scale: f64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(30),
            entry_settle: Duration::from_secs(10),
            sign_in_settle: Duration::from_secs(8),
            page_settle: Duration::from_secs(5),
            branch_timeout: Duration::from_secs(10),
            network_idle_timeout: Duration::from_secs(10),
            dom_ready_timeout: Duration::from_secs(60),
            workspace_network_idle_timeout: Duration::from_secs(30),
            url_poll_interval: Duration::from_secs(5),
            icon_timeout: Duration::from_secs(5),
            bootstrap_pause: Duration::from_secs(120),
            marker_timeout: Duration::from_secs(10),
            reload_settle: Duration::from_secs(60),
            full_ready_linger: Duration::from_secs(15),
            retry_backoff: Duration::from_secs(2),
            pacing_scale: 1.0,
            lookup_scale: 1.0,
        }
    }
}

impl Timings {
    /// Every wait collapsed to zero. Lookups still run once.
    pub fn immediate() -> Self {
        Self {
            navigation_timeout: Duration::ZERO,
            entry_settle: Duration::ZERO,
            sign_in_settle: Duration::ZERO,
            page_settle: Duration::ZERO,
            branch_timeout: Duration::ZERO,
            network_idle_timeout: Duration::ZERO,
            dom_ready_timeout: Duration::ZERO,
            workspace_network_idle_timeout: Duration::ZERO,
            url_poll_interval: Duration::ZERO,
            icon_timeout: Duration::ZERO,
            bootstrap_pause: Duration::ZERO,
            marker_timeout: Duration::ZERO,
            reload_settle: Duration::ZERO,
            full_ready_linger: Duration::ZERO,
            retry_backoff: Duration::ZERO,
            pacing_scale: 0.0,
            lookup_scale: 0.0,
        }
    }

    /// Scales a nominal selector budget. A zero budget still queries once.
    pub fn lookup(&self, nominal: Duration) -> Duration {
        nominal.mul_f64(self.lookup_scale.max(0.0))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_prefix: String,
    pub app_url: String,
    pub session_file: PathBuf,
    /// Overrides the URL derived from the workstation token.
    pub workstation_url: Option<String>,
    pub login: Option<LoginCredentials>,
    pub telegram: Option<TelegramCredentials>,
    pub interval: Duration,
    pub max_attempts: u32,
    /// Treat best-effort confirmations that were only assumed as failures.
    pub strict: bool,
    pub browser: BrowserOptions,
    pub timings: Timings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_prefix: DEFAULT_BASE_PREFIX.to_string(),
            app_url: DEFAULT_APP_URL.to_string(),
            session_file: PathBuf::from(DEFAULT_SESSION_FILE),
            workstation_url: None,
            login: None,
            telegram: None,
            interval: interval_from_minutes(DEFAULT_INTERVAL_MINUTES),
            max_attempts: MAX_ATTEMPTS,
            strict: false,
            browser: BrowserOptions::default(),
            timings: Timings::default(),
        }
    }
}

impl Config {
    /// Reads the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup. Empty values are
    /// treated as absent.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Config::default();

        if let Some(prefix) = get(ENV_BASE_PREFIX) {
            config.base_prefix = prefix;
        }
        if let Some(url) = get(ENV_APP_URL) {
            config.app_url = url;
        }
        if let Some(path) = get(ENV_SESSION_FILE) {
            config.session_file = PathBuf::from(path);
        }
        config.workstation_url = get(ENV_WORKSTATION_URL);

        config.login = match (get(ENV_EMAIL), get(ENV_PASSWORD)) {
            (Some(email), Some(password)) => Some(LoginCredentials { email, password }),
            _ => None,
        };
        config.telegram = match (get(ENV_TG_TOKEN), get(ENV_TG_CHAT_ID)) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramCredentials { bot_token, chat_id }),
            _ => None,
        };

        if let Some(raw) = get(ENV_INTERVAL_MINUTES) {
            match raw.parse::<u64>() {
                Ok(minutes) => config.interval = interval_from_minutes(minutes),
                Err(_) => warn!(
                    value = %raw,
                    "{ENV_INTERVAL_MINUTES} is not a whole number of minutes, using {DEFAULT_INTERVAL_MINUTES}"
                ),
            }
        }

        if let Some(flag) = get(ENV_STRICT).and_then(|v| parse_flag(&v)) {
            config.strict = flag;
        }
        config.browser.executable = get(ENV_CHROME_PATH).map(PathBuf::from);
        if let Some(flag) = get(ENV_HEADLESS).and_then(|v| parse_flag(&v)) {
            config.browser.headless = flag;
        }
        if let Some(flag) = get(ENV_NO_SANDBOX).and_then(|v| parse_flag(&v)) {
            config.browser.sandbox = !flag;
        }

        config
    }

    pub fn set_interval_minutes(&mut self, minutes: u64) {
        self.interval = interval_from_minutes(minutes);
    }

    /// Host part of the app URL, used to recognise pages of the origin service.
    pub fn app_host(&self) -> String {
        match reqwest::Url::parse(&self.app_url) {
            Ok(url) => url.host_str().unwrap_or(&self.app_url).to_string(),
            Err(_) => self
                .app_url
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

/// Converts a minute count to the scheduler interval, clamped to the minimum.
/// Counts too large to express in seconds saturate.
pub fn interval_from_minutes(minutes: u64) -> Duration {
    Duration::from_secs(minutes.max(MIN_INTERVAL_MINUTES).saturating_mul(60))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Keeps the first `visible` characters and elides the rest.
pub fn mask(value: &str, visible: usize) -> String {
    let head: String = value.chars().take(visible).collect();
    format!("{head}...")
}
