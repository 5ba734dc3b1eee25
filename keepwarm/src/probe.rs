//! Browser-less reachability check of the workstation.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use reqwest::StatusCode;
use tracing::{debug, instrument};

use crate::config::{mask, Config};
use crate::credentials::resolve_workstation_url;
use crate::record::{Milestone, Outcome, RunLog};
use crate::session::{SessionStore, WORKSTATION_TOKEN_COOKIE};
use crate::AutomationError;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Headers sent with every probe, in the order they are rendered.
pub const PROBE_HEADERS: [(&str, &str); 5] = [
    (
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
    ),
    ("Accept-Language", "en-US"),
    ("Connection", "keep-alive"),
    ("Referer", "https://workstations.cloud.google.com/"),
    (
        "User-Agent",
        "Mozilla/5.0 (iPhone; CPU iPhone OS 16_5 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.5 Mobile/15E148 Safari/604.1",
    ),
];

/// Issues the probe request. Redirects are not followed, so a bounce to a
/// sign-in page counts as unreachable.
#[derive(Debug, Clone)]
pub struct Prober {
    client: reqwest::Client,
}

impl Prober {
    pub fn new() -> Result<Self, AutomationError> {
        Self::with_timeout(PROBE_TIMEOUT)
    }

    /// Redirects are returned as-is: following one would land on the sign-in
    /// page, whose 200 would be mistaken for direct access.
    pub fn with_timeout(timeout: Duration) -> Result<Self, AutomationError> {
        let mut headers = HeaderMap::new();
        for (name, value) in PROBE_HEADERS {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| AutomationError::InvalidArgument(format!("{name}: {e}")))?;
            headers.insert(name, HeaderValue::from_static(value));
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    /// True iff `url` answers exactly 200 when presented with `token`.
    #[instrument(level = "debug", skip(self, token, log))]
    pub async fn check(&self, url: &str, token: &str, log: &mut RunLog) -> bool {
        log.info(format!("Probing workstation at {url}"));
        log.info(format!("Using token {} (truncated)", mask(token, 20)));

        let cookie = match HeaderValue::from_str(&format!("{WORKSTATION_TOKEN_COOKIE}={token}")) {
            Ok(cookie) => cookie,
            Err(e) => {
                log.warn(format!("Token cannot be sent as a cookie: {e}"));
                return false;
            }
        };

        match self.client.get(url).header(COOKIE, cookie).send().await {
            Ok(response) => {
                let status = response.status();
                log.info(format!("Probe status: {}", status.as_u16()));
                if status == StatusCode::OK {
                    log.milestone(
                        Milestone::DirectAccess,
                        Outcome::Success,
                        "Status 200, workstation is directly reachable",
                    );
                    true
                } else {
                    log.info(format!(
                        "Status {}, workstation is not directly reachable",
                        status.as_u16()
                    ));
                    false
                }
            }
            Err(e) => {
                debug!(error = ?e, "probe transport error");
                log.warn(format!("Probe request failed: {e}"));
                false
            }
        }
    }
}

/// Runs the probe with the stored token. No stored token means the probe is
/// skipped.
pub async fn fast_path(
    prober: &Prober,
    config: &Config,
    store: &SessionStore,
    log: &mut RunLog,
) -> bool {
    let state = store.read_existing();
    let Some(token) = state.as_ref().and_then(|s| s.workstation_token()) else {
        log.info(format!(
            "No {WORKSTATION_TOKEN_COOKIE} stored, skipping the direct probe"
        ));
        return false;
    };
    let url = resolve_workstation_url(Some(token), config, store, log);
    prober.check(&url, token, log).await
}
