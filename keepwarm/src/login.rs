//! Interactive sign-in and stored-session reuse.
//!
//! The sign-in flow is an explicit state machine over one page:
//!
//! ```text
//! Start -> NavigateEntry -> OpenSignIn -> Branch -+-> ChooseAccount ---------------+
//!                                                 +-> CredentialForm -> EmailEntry -+-> PasswordEntry
//! PasswordEntry -> PostSubmitCheck -> Success | Failure
//! ```
//!
//! Every lookup degrades to the next strategy; a state fails only once all of
//! its strategies are exhausted.

use std::ops::RangeInclusive;
use std::time::Duration;

use tracing::instrument;

use crate::config::{mask, Config, LoginCredentials, ACCOUNTS_URL};
use crate::locator::Locator;
use crate::pacing::{halves, Pacer};
use crate::platforms::{ElementHandle, LoadState, Page};
use crate::record::RunLog;
use crate::selector::{selector_list, Selector};
use crate::workspace::{
    navigate_via_workspace_icon, Confirmation, SESSION_ICON_CHECKS, WORKSPACE_ICON_SELECTORS,
};
use crate::AutomationError;

const GET_STARTED_SELECTORS: &[&str] = &[
    r#"a[href="/new"]"#,
    r#"a[href="/new"] span:has-text("Get Started")"#,
    r##"#nav [role="link"]:has-text("Get Started")"##,
    r#"a:has-text("Get Started")"#,
    r#"[data-testid="get-started-button"]"#,
    ".get-started-btn",
    r#"button:has-text("Get Started")"#,
    r#"[aria-label="Get Started"]"#,
];

const CHOOSE_ACCOUNT_MARKER: &str = r#"text="Choose an account""#;
const FIRST_ACCOUNT_ENTRY: &str = ".OVnw0d";

const EMAIL_LABELS: [&str; 2] = ["Email or phone", "电子邮件地址或电话号码"];
const EMAIL_SELECTORS: &[&str] = &[
    r#"input[type="email"]"#,
    r#"input[name="identifier"]"#,
    r#"[aria-label="电子邮件地址或电话号码"]"#,
    r#"[aria-label="Email or phone"]"#,
];

const PASSWORD_LABELS: [&str; 2] = ["Enter your password", "输入您的密码"];
const PASSWORD_SELECTORS: &[&str] = &[
    r#"input[type="password"]"#,
    r#"input[name="password"]"#,
    r#"input[name="Passwd"]"#,
    r#"[aria-label="输入您的密码"]"#,
    r#"[aria-label="Enter your password"]"#,
];

const NEXT_BUTTON_NAMES: [&str; 2] = ["Next", "下一步"];
const NEXT_BUTTON_SELECTORS: &[&str] = &[
    r#"button:has-text("下一步")"#,
    r#"button:has-text("Next")"#,
    r#"[role="button"]:has-text("下一步")"#,
    r#"[role="button"]:has-text("Next")"#,
];

/// Pauses of the field-clearing and typing ritual, in seconds unless noted.
struct TypingProfile {
    after_click: RangeInclusive<f64>,
    after_select_all: RangeInclusive<f64>,
    after_delete: RangeInclusive<f64>,
    key_delay_ms: RangeInclusive<u64>,
    between_halves: RangeInclusive<f64>,
    after_typing: RangeInclusive<f64>,
}

const EMAIL_TYPING: TypingProfile = TypingProfile {
    after_click: 1.2..=2.5,
    after_select_all: 0.3..=0.8,
    after_delete: 0.5..=1.2,
    key_delay_ms: 80..=150,
    between_halves: 0.2..=0.6,
    after_typing: 2.5..=4.0,
};

const PASSWORD_TYPING: TypingProfile = TypingProfile {
    after_click: 1.5..=3.0,
    after_select_all: 0.2..=0.5,
    after_delete: 0.8..=1.5,
    key_delay_ms: 100..=200,
    between_halves: 0.3..=0.8,
    after_typing: 2.0..=3.5,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum LoginState {
    Start,
    NavigateEntry,
    OpenSignIn,
    Branch,
    ChooseAccount,
    CredentialForm,
    EmailEntry(ElementHandle),
    PasswordEntry,
    PostSubmitCheck,
    Success,
    Failure,
}

/// Signs in through the app's UI with the configured credentials.
pub struct LoginFlow<'a> {
    page: &'a dyn Page,
    config: &'a Config,
    pacer: Pacer,
}

impl<'a> LoginFlow<'a> {
    pub fn new(page: &'a dyn Page, config: &'a Config) -> Self {
        Self {
            page,
            config,
            pacer: Pacer::new(config.timings.pacing_scale),
        }
    }

    fn credentials(&self) -> Option<&'a LoginCredentials> {
        self.config.login.as_ref()
    }

    fn lookup(&self, nominal_secs: u64) -> Duration {
        self.config
            .timings
            .lookup(Duration::from_secs(nominal_secs))
    }

    /// Runs the flow to completion. On success the workspace icon has been
    /// clicked and the result of that navigation is returned.
    #[instrument(level = "debug", skip_all)]
    pub async fn run(&self, log: &mut RunLog) -> Confirmation {
        log.info("Starting the UI login flow");
        let mut state = LoginState::Start;
        loop {
            state = match state {
                LoginState::Success => {
                    tokio::time::sleep(self.config.timings.page_settle).await;
                    log.info("Signed in, navigating to the workspace");
                    return navigate_via_workspace_icon(self.page, &self.config.timings, log).await;
                }
                LoginState::Failure => return Confirmation::refused(),
                other => self.step(other, log).await,
            };
        }
    }

    async fn step(&self, state: LoginState, log: &mut RunLog) -> LoginState {
        match state {
            LoginState::Start => {
                if self.credentials().is_some() {
                    LoginState::NavigateEntry
                } else {
                    log.warn("IDX_EMAIL or IDX_PASSWORD is not set, cannot sign in");
                    LoginState::Failure
                }
            }
            LoginState::NavigateEntry => self.navigate_entry(log).await,
            LoginState::OpenSignIn => self.open_sign_in(log).await,
            LoginState::Branch => self.branch(log).await,
            LoginState::ChooseAccount => self.choose_account(log).await,
            LoginState::CredentialForm => self.credential_form(log).await,
            LoginState::EmailEntry(field) => self.email_entry(&field, log).await,
            LoginState::PasswordEntry => self.password_entry(log).await,
            LoginState::PostSubmitCheck => self.post_submit_check(log).await,
            terminal @ (LoginState::Success | LoginState::Failure) => terminal,
        }
    }

    async fn navigate_entry(&self, log: &mut RunLog) -> LoginState {
        let timings = &self.config.timings;
        match self
            .page
            .goto(&self.config.app_url, timings.navigation_timeout)
            .await
        {
            Ok(()) => {
                if let Err(e) = self
                    .page
                    .wait_for_load_state(LoadState::DomContentLoaded, timings.navigation_timeout)
                    .await
                {
                    log.info(format!("DOM load wait ended early: {e}"));
                }
                log.info("App page loaded");
            }
            Err(e) => log.warn(format!(
                "Navigation to {} failed ({e}), continuing",
                self.config.app_url
            )),
        }
        tokio::time::sleep(timings.entry_settle).await;
        LoginState::OpenSignIn
    }

    async fn open_sign_in(&self, log: &mut RunLog) -> LoginState {
        let button = Locator::new(self.page.as_frame(), selector_list(GET_STARTED_SELECTORS))
            .describe("the 'Get Started' button")
            .set_default_timeout(self.lookup(20))
            .rounds(3)
            .backoff(self.config.timings.retry_backoff)
            .first(log)
            .await;

        let clicked = match button {
            Some(button) => self.click_with_fallbacks(&button, "'Get Started'", log).await,
            None => false,
        };
        if !clicked {
            log.info(format!("Opening {ACCOUNTS_URL} directly"));
            if let Err(e) = self
                .page
                .goto(ACCOUNTS_URL, self.config.timings.navigation_timeout)
                .await
            {
                log.warn(format!("Navigation to the sign-in page failed: {e}"));
            }
        }
        tokio::time::sleep(self.config.timings.sign_in_settle).await;
        LoginState::Branch
    }

    /// Native click, then scripted click, then focus and Enter.
    async fn click_with_fallbacks(
        &self,
        element: &ElementHandle,
        what: &str,
        log: &mut RunLog,
    ) -> bool {
        match self.page.click(element).await {
            Ok(()) => {
                log.info(format!("Clicked {what}"));
                return true;
            }
            Err(e) => log.info(format!("Clicking {what} failed: {e}")),
        }
        match self.page.js_click(element).await {
            Ok(()) => {
                log.info(format!("Clicked {what} via script"));
                return true;
            }
            Err(e) => log.info(format!("Scripted click on {what} failed: {e}")),
        }
        let pressed = async {
            self.page.focus(element).await?;
            self.page.press(element, "Enter").await
        }
        .await;
        match pressed {
            Ok(()) => {
                log.info(format!("Activated {what} with Enter"));
                true
            }
            Err(e) => {
                log.info(format!("Keyboard activation of {what} failed: {e}"));
                false
            }
        }
    }

    async fn branch(&self, log: &mut RunLog) -> LoginState {
        if let Err(e) = self
            .page
            .wait_for_load_state(LoadState::DomContentLoaded, self.config.timings.branch_timeout)
            .await
        {
            log.info(format!("Sign-in page load wait ended early: {e}"));
        }
        log.info(format!(
            "Current URL: {}",
            self.page.url().await.unwrap_or_default()
        ));
        match self.page.query(&Selector::from(CHOOSE_ACCOUNT_MARKER)).await {
            Ok(Some(_)) => {
                log.info("Account chooser shown");
                LoginState::ChooseAccount
            }
            _ => {
                log.info("No account chooser, using the credential form");
                LoginState::CredentialForm
            }
        }
    }

    async fn choose_account(&self, log: &mut RunLog) -> LoginState {
        let Some(creds) = self.credentials() else {
            return LoginState::Failure;
        };
        let entries = [
            Selector::text(creds.email.as_str()),
            Selector::has_text("div", creds.email.as_str()),
            Selector::from(FIRST_ACCOUNT_ENTRY),
        ];
        let mut chosen = false;
        for entry in &entries {
            let Ok(Some(account)) = self.page.query(entry).await else {
                continue;
            };
            log.info(format!("Choosing account entry {entry}"));
            if self.page.click(&account).await.is_err() {
                if let Err(e) = self.page.js_click(&account).await {
                    log.info(format!("Could not click the account entry: {e}"));
                    continue;
                }
            }
            if let Err(e) = self
                .page
                .wait_for_load_state(
                    LoadState::NetworkIdle,
                    self.config.timings.network_idle_timeout,
                )
                .await
            {
                log.info(format!("Network did not settle after choosing the account: {e}"));
            }
            chosen = true;
            break;
        }
        if !chosen {
            log.info("No account entry could be chosen, continuing with the password");
        }
        LoginState::PasswordEntry
    }

    /// Tries each label in turn with its own budget, then the selector list.
    async fn find_field(
        &self,
        labels: &[(&str, u64)],
        selectors: &[&str],
        list_budget: u64,
        description: &str,
        log: &mut RunLog,
    ) -> Option<ElementHandle> {
        for (label, budget) in labels {
            if let Ok(field) = self
                .page
                .wait_for_selector(&Selector::label(*label), self.lookup(*budget))
                .await
            {
                log.info(format!("Found {description} by label '{label}'"));
                return Some(field);
            }
        }
        Locator::new(self.page.as_frame(), selector_list(selectors))
            .describe(description)
            .set_default_timeout(self.lookup(list_budget))
            .rounds(3)
            .backoff(self.config.timings.retry_backoff)
            .first(log)
            .await
    }

    async fn credential_form(&self, log: &mut RunLog) -> LoginState {
        let labels = [(EMAIL_LABELS[0], 5), (EMAIL_LABELS[1], 5)];
        match self
            .find_field(&labels, EMAIL_SELECTORS, 15, "the email field", log)
            .await
        {
            Some(field) => LoginState::EmailEntry(field),
            None => {
                log.warn("No email field found, the login flow cannot continue");
                LoginState::Failure
            }
        }
    }

    /// Click, select all, delete, then type the text in two bursts.
    async fn type_like_a_person(
        &self,
        field: &ElementHandle,
        text: &str,
        profile: &TypingProfile,
    ) -> Result<(), AutomationError> {
        if self.page.click(field).await.is_err() {
            self.page.focus(field).await?;
        }
        self.pacer.pause(profile.after_click.clone()).await;
        self.page.press(field, "Control+a").await?;
        self.pacer.pause(profile.after_select_all.clone()).await;
        self.page.press(field, "Delete").await?;
        self.pacer.pause(profile.after_delete.clone()).await;

        let (first, second) = halves(text);
        for part in [first, second] {
            let delay = self.pacer.key_delay(profile.key_delay_ms.clone());
            self.page.type_text(field, part, delay).await?;
            self.pacer.pause(profile.between_halves.clone()).await;
        }
        Ok(())
    }

    /// Types with the ritual, falling back to a bulk fill.
    async fn enter_text(
        &self,
        field: &ElementHandle,
        text: &str,
        profile: &TypingProfile,
        description: &str,
        log: &mut RunLog,
    ) -> bool {
        if let Err(e) = self.type_like_a_person(field, text, profile).await {
            log.info(format!("Typing the {description} failed ({e}), filling it instead"));
            if let Err(e) = self.page.fill(field, text).await {
                log.warn(format!("Filling the {description} failed: {e}"));
                return false;
            }
        }
        self.pacer.pause(profile.after_typing.clone()).await;
        true
    }

    /// Clicks a found "Next" button after hovering, or presses Enter in the field.
    async fn submit(
        &self,
        button: Option<ElementHandle>,
        field: &ElementHandle,
        hover_pause: RangeInclusive<f64>,
        log: &mut RunLog,
    ) {
        if let Some(button) = button {
            log.info("Clicking 'Next'");
            if let Err(e) = self.page.hover(&button).await {
                log.info(format!("Hover failed: {e}"));
            }
            self.pacer.pause(hover_pause).await;
            match self.page.click(&button).await {
                Ok(()) => return,
                Err(e) => log.info(format!("Clicking 'Next' failed ({e}), pressing Enter")),
            }
        } else {
            log.info("No 'Next' button found, pressing Enter");
        }
        match self.page.press(field, "Enter").await {
            Ok(()) => log.info("Submitted with Enter"),
            Err(e) => log.warn(format!("Pressing Enter failed: {e}")),
        }
    }

    async fn email_entry(&self, field: &ElementHandle, log: &mut RunLog) -> LoginState {
        let Some(creds) = self.credentials() else {
            return LoginState::Failure;
        };
        if !self
            .enter_text(field, &creds.email, &EMAIL_TYPING, "email", log)
            .await
        {
            return LoginState::Failure;
        }
        log.info(format!("Entered email {}", mask_email(&creds.email)));

        let next = Locator::new(self.page.as_frame(), selector_list(NEXT_BUTTON_SELECTORS))
            .describe("the 'Next' button")
            .set_default_timeout(self.lookup(15))
            .rounds(3)
            .backoff(self.config.timings.retry_backoff)
            .first(log)
            .await;
        self.submit(next, field, 0.5..=1.2, log).await;
        self.pacer.pause(6.0..=10.0).await;
        LoginState::PasswordEntry
    }

    async fn password_entry(&self, log: &mut RunLog) -> LoginState {
        let Some(creds) = self.credentials() else {
            return LoginState::Failure;
        };
        log.info(format!(
            "Waiting for the password field, URL: {}",
            self.page.url().await.unwrap_or_default()
        ));
        let labels = [(PASSWORD_LABELS[0], 15), (PASSWORD_LABELS[1], 10)];
        let Some(field) = self
            .find_field(&labels, PASSWORD_SELECTORS, 20, "the password field", log)
            .await
        else {
            log.warn("No password field found, the login flow cannot continue");
            return LoginState::Failure;
        };

        if !self
            .enter_text(&field, &creds.password, &PASSWORD_TYPING, "password", log)
            .await
        {
            return LoginState::Failure;
        }
        log.info("Entered password (hidden)");

        let next = self.find_password_next(log).await;
        self.submit(next, &field, 0.8..=1.5, log).await;
        log.info("Waiting for sign-in to complete");
        self.pacer.pause(12.0..=18.0).await;
        LoginState::PostSubmitCheck
    }

    async fn find_password_next(&self, log: &mut RunLog) -> Option<ElementHandle> {
        for (name, budget) in [(NEXT_BUTTON_NAMES[0], 10), (NEXT_BUTTON_NAMES[1], 5)] {
            if let Ok(button) = self
                .page
                .wait_for_selector(&Selector::role("button", Some(name)), self.lookup(budget))
                .await
            {
                log.info(format!("Found the '{name}' button by role"));
                return Some(button);
            }
        }
        Locator::new(self.page.as_frame(), selector_list(NEXT_BUTTON_SELECTORS))
            .describe("the password page 'Next' button")
            .set_default_timeout(self.lookup(10))
            .rounds(2)
            .backoff(self.config.timings.retry_backoff)
            .first(log)
            .await
    }

    async fn post_submit_check(&self, log: &mut RunLog) -> LoginState {
        let host = self.config.app_host();
        let mut url = self.page.url().await.unwrap_or_default();
        log.info(format!("URL after sign-in: {url}"));

        if !url.contains(&host) {
            log.info(format!("Not on {host}, navigating back"));
            let timings = &self.config.timings;
            match self
                .page
                .goto(&self.config.app_url, timings.navigation_timeout)
                .await
            {
                Ok(()) => {
                    if let Err(e) = self
                        .page
                        .wait_for_load_state(LoadState::DomContentLoaded, timings.navigation_timeout)
                        .await
                    {
                        log.info(format!("DOM load wait ended early: {e}"));
                    }
                }
                Err(e) => log.warn(format!("Navigation back failed: {e}")),
            }
            tokio::time::sleep(timings.page_settle).await;
            url = self.page.url().await.unwrap_or_default();
            log.info(format!("URL after navigating back: {url}"));
        }

        if is_signed_in_address(&url, &host) {
            log.info("Login succeeded, the URL has no sign-in marker");
            LoginState::Success
        } else {
            log.warn("Login probably failed, the URL still points at sign-in or another host");
            LoginState::Failure
        }
    }
}

/// On the app host and not on a sign-in page.
pub fn is_signed_in_address(url: &str, app_host: &str) -> bool {
    url.contains(app_host) && !url.contains("signin")
}

fn mask_email(email: &str) -> String {
    let tail: String = {
        let chars: Vec<char> = email.chars().collect();
        chars[chars.len().saturating_sub(3)..].iter().collect()
    };
    format!("{}{tail}", mask(email, 3))
}

/// Opens the app with the restored session and, if it is still signed in,
/// clicks into the workspace.
///
/// Both the address and a visible workspace icon must confirm the session.
#[instrument(level = "debug", skip_all)]
pub async fn resume_session(page: &dyn Page, config: &Config, log: &mut RunLog) -> Confirmation {
    let timings = &config.timings;
    log.info(format!("Opening {} to check the stored session", config.app_url));
    if let Err(e) = page.goto(&config.app_url, timings.navigation_timeout).await {
        log.warn(format!("Opening {} failed: {e}", config.app_url));
        return Confirmation::refused();
    }
    if let Err(e) = page
        .wait_for_load_state(LoadState::DomContentLoaded, timings.navigation_timeout)
        .await
    {
        log.info(format!("DOM load wait ended early: {e}"));
    }
    tokio::time::sleep(timings.page_settle).await;

    let url = page.url().await.unwrap_or_default();
    log.info(format!("Current URL: {url}"));
    let address_ok = is_signed_in_address(&url, &config.app_host());

    let mut icon_visible = false;
    for raw in WORKSPACE_ICON_SELECTORS.iter().take(SESSION_ICON_CHECKS) {
        if page
            .wait_for_selector(&Selector::from(*raw), timings.icon_timeout)
            .await
            .is_ok()
        {
            log.info(format!("Workspace icon visible via {raw}"));
            icon_visible = true;
            break;
        }
    }

    if address_ok && icon_visible {
        log.info("Stored session is signed in and the workspace icon is visible");
        navigate_via_workspace_icon(page, timings, log).await
    } else {
        log.info(format!(
            "Stored session not usable: signed-in address {address_ok}, workspace icon {icon_visible}"
        ));
        Confirmation::refused()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_in_address_needs_host_and_no_signin() {
        assert!(is_signed_in_address("https://idx.google.com/", "idx.google.com"));
        assert!(!is_signed_in_address(
            "https://idx.google.com/signin?continue=x",
            "idx.google.com"
        ));
        assert!(!is_signed_in_address(
            "https://accounts.google.com/v3/signin",
            "idx.google.com"
        ));
    }

    #[test]
    fn selector_tables_parse() {
        for raw in GET_STARTED_SELECTORS
            .iter()
            .chain(EMAIL_SELECTORS)
            .chain(PASSWORD_SELECTORS)
            .chain(NEXT_BUTTON_SELECTORS)
        {
            assert!(Selector::from(*raw).is_valid(), "{raw}");
        }
        assert_eq!(
            Selector::from(CHOOSE_ACCOUNT_MARKER),
            Selector::text("Choose an account")
        );
    }

    #[test]
    fn email_is_masked_at_both_ends() {
        assert_eq!(mask_email("someone@example.com"), "som...com");
        assert_eq!(mask_email("ab"), "ab...ab");
    }
}
