//! End-of-run report delivery.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::debug;

use crate::config::{mask, TelegramCredentials};
use crate::record::{Milestone, Outcome, RunLog, TIMESTAMP_FORMAT};
use crate::AutomationError;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Characters MarkdownV2 treats as markup
const MARKDOWN_SPECIALS: &str = r"_*[]()~`>#+-=|{}.!";

/// Receives the attempt record at the end of each run.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers a report built from `log`. Delivery problems are written back
    /// to `log`; they never fail the run.
    async fn notify(&self, log: &mut RunLog, domain: &str);
}

/// Escapes every MarkdownV2 special character.
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_SPECIALS.contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn outcome_emoji(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Success => "✅",
        Outcome::Failure => "❌",
        Outcome::Info => "ℹ️",
    }
}

/// Renders the MarkdownV2 report for one run.
///
/// A run that got through on the direct probe gets a short summary; anything
/// else lists each milestone once, oldest first.
pub fn format_report(log: &RunLog, domain: &str, now: DateTime<Local>) -> String {
    let mut seen = HashSet::new();
    let key_lines: Vec<_> = log
        .milestones()
        .filter(|(line, _, _)| seen.insert(line.message.as_str()))
        .collect();

    let mut report = String::from("*🔔 Workstation keep\\-warm report 🔔*\n\n");

    if key_lines
        .iter()
        .any(|(_, milestone, _)| *milestone == Milestone::DirectAccess)
    {
        report.push_str("✅ *Probe*: status 200, the workstation is directly reachable\n\n");
        report.push_str("*📋 Summary:*\n");
        report.push_str("✅ Directly reachable, no browser automation needed\n");
    } else {
        let successes = key_lines
            .iter()
            .filter(|(_, _, o)| *o == Outcome::Success)
            .count();
        let failures = key_lines
            .iter()
            .filter(|(_, _, o)| *o == Outcome::Failure)
            .count();
        let status = if successes > failures { "✅" } else { "❌" };
        report.push_str(&format!(
            "{status} *Summary*: {successes} succeeded, {failures} failed\n\n"
        ));
        report.push_str("*📋 Details:*\n");
        for (line, _, outcome) in &key_lines {
            report.push_str(&format!(
                "{} `{}`: {}\n",
                outcome_emoji(*outcome),
                escape_markdown(&line.timestamp.format(TIMESTAMP_FORMAT).to_string()),
                escape_markdown(&line.message)
            ));
        }
    }

    report.push_str(&format!("\n🌐 *Workstation*: `{}`\n", escape_markdown(domain)));
    report.push_str(&format!(
        "\n🕒 *Run time*: `{}`\n",
        escape_markdown(&now.format(TIMESTAMP_FORMAT).to_string())
    ));
    report.push('\n');
    report.push_str(&"\\-".repeat(22));
    report.push('\n');
    report.push_str("_Generated by keepwarm_");
    report
}

/// Posts reports to a Telegram chat through the Bot API.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    credentials: Option<TelegramCredentials>,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(credentials: Option<TelegramCredentials>) -> Result<Self, AutomationError> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self {
            credentials,
            api_base: TELEGRAM_API_BASE.to_string(),
            client,
        })
    }

    /// Points the notifier at another Bot API host.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    async fn send(
        &self,
        credentials: &TelegramCredentials,
        text: &str,
    ) -> Result<reqwest::StatusCode, AutomationError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, credentials.bot_token);
        let response = self
            .client
            .post(url)
            .form(&[
                ("chat_id", credentials.chat_id.as_str()),
                ("text", text),
                ("parse_mode", "MarkdownV2"),
            ])
            .send()
            .await?;
        Ok(response.status())
    }
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, log: &mut RunLog, domain: &str) {
        let Some(credentials) = &self.credentials else {
            log.info("TG_TOKEN or TG_CHAT_ID not set, skipping the notification");
            return;
        };

        let text = format_report(log, domain, Local::now());
        debug!(chars = text.len(), "report rendered");
        log.info(format!(
            "Sending the report with TG_TOKEN={} and TG_CHAT_ID={}",
            mask(&credentials.bot_token, 5),
            mask(&credentials.chat_id, 3)
        ));
        match self.send(credentials, &text).await {
            Ok(status) => log.info(format!("Telegram notification status: {}", status.as_u16())),
            Err(e) => log.warn(format!("Telegram notification failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specials_are_escaped() {
        assert_eq!(escape_markdown("a.b-c!"), "a\\.b\\-c\\!");
        assert_eq!(escape_markdown("(x)_[y]"), "\\(x\\)\\_\\[y\\]");
        assert_eq!(escape_markdown("plain text"), "plain text");
    }

    #[test]
    fn direct_access_gets_the_short_summary() {
        let mut log = RunLog::new();
        log.milestone(Milestone::DirectAccess, Outcome::Success, "Status 200");
        let report = format_report(&log, "https://ws.example", Local::now());
        assert!(report.contains("directly reachable"));
        assert!(!report.contains("Details"));
        assert!(report.contains("`https://ws\\.example`"));
    }

    #[test]
    fn milestones_are_counted_once() {
        let mut log = RunLog::new();
        log.info("noise that is not reported");
        log.milestone(Milestone::SessionReuse, Outcome::Failure, "Stored session failed");
        log.milestone(Milestone::SessionReuse, Outcome::Failure, "Stored session failed");
        log.milestone(Milestone::UiLogin, Outcome::Success, "UI login flow succeeded");
        log.milestone(Milestone::SessionSaved, Outcome::Success, "Saved session.");
        let report = format_report(&log, "d", Local::now());

        assert!(report.contains("✅ *Summary*: 2 succeeded, 1 failed"));
        assert_eq!(report.matches("Stored session failed").count(), 1);
        assert!(report.contains("Saved session\\."));
        assert!(!report.contains("noise"));
        assert!(report.ends_with("_Generated by keepwarm_"));
    }

    #[test]
    fn failures_outweighing_successes_get_a_cross() {
        let mut log = RunLog::new();
        log.milestone(Milestone::RunResult, Outcome::Failure, "Automation result: failure");
        let report = format_report(&log, "d", Local::now());
        assert!(report.contains("❌ *Summary*: 0 succeeded, 1 failed"));
    }

    #[tokio::test]
    async fn missing_credentials_skip_sending() {
        let notifier = TelegramNotifier::new(None).unwrap();
        let mut log = RunLog::new();
        notifier.notify(&mut log, "d").await;
        assert!(log.contains("skipping the notification"));
    }
}
