//! Entering the workspace and deciding when its IDE is usable.

use tracing::{debug, instrument};

use crate::config::{Config, Timings};
use crate::platforms::{Frame, LoadState, Page};
use crate::record::{Milestone, Outcome, RunLog};
use crate::selector::Selector;

/// Workspace tiles on the app's dashboard, most specific first.
pub const WORKSPACE_ICON_SELECTORS: [&str; 7] = [
    r#"div[class="workspace-icon"]"#,
    r#"img[src="https://www.gstatic.com/monospace/250314/workspace-blank-192.png"]"#,
    ".workspace-icon",
    r#"img[role="presentation"][class="custom-icon"]"#,
    r#"div[_ngcontent-ng-c2464377164][class="workspace-icon"]"#,
    "div.workspace-icon img.custom-icon",
    ".workspace-icon img",
];

/// Session reuse only checks the first few icon selectors.
pub const SESSION_ICON_CHECKS: usize = 4;

/// Class that only the IDE frame carries
const IDE_FRAME_MARKER: &str = "codicon-explorer-view-icon";

/// Explorer, search, source control, run-and-debug and the "Web" preview tab.
pub const READINESS_MARKERS: [&str; 5] = [
    r#"[class*="codicon-explorer-view-icon"], [aria-label*="Explorer"]"#,
    r#"[class*="codicon-search-view-icon"], [aria-label*="Search"]"#,
    r#"[class*="codicon-source-control-view-icon"], [aria-label*="Source Control"]"#,
    r#"[class*="codicon-run-view-icon"], [aria-label*="Run and Debug"]"#,
    r#"div[aria-label="Web"] span.tab-label-name, div[aria-label*="Web"], [class*="monaco-icon-label"] span.monaco-icon-name-container:has-text("Web")"#,
];

/// Markers needed for a partial success
pub const MIN_READY_MARKERS: usize = 4;
pub const MAX_READINESS_PROBES: u32 = 3;

/// How sure a best-effort step is about its own success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Certainty {
    /// Observed directly
    Confirmed,
    /// Observed in part
    Partial,
    /// Not observed; carrying on regardless
    Assumed,
}

/// Result of a navigation step that may proceed without proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub proceed: bool,
    pub certainty: Certainty,
}

impl Confirmation {
    pub fn confirmed() -> Self {
        Self {
            proceed: true,
            certainty: Certainty::Confirmed,
        }
    }

    pub fn assumed() -> Self {
        Self {
            proceed: true,
            certainty: Certainty::Assumed,
        }
    }

    pub fn refused() -> Self {
        Self {
            proceed: false,
            certainty: Certainty::Confirmed,
        }
    }

    /// Strict callers do not accept an assumed success.
    pub fn accepted(&self, strict: bool) -> bool {
        self.proceed && !(strict && self.certainty == Certainty::Assumed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub reached: bool,
    pub certainty: Certainty,
    /// Markers seen by the last probe
    pub markers: usize,
}

impl Readiness {
    fn not_reached() -> Self {
        Self {
            reached: false,
            certainty: Certainty::Confirmed,
            markers: 0,
        }
    }

    pub fn accepted(&self, strict: bool) -> bool {
        self.reached && !(strict && self.certainty == Certainty::Assumed)
    }
}

/// Finds a workspace icon and clicks it, falling back to a scripted click.
async fn click_workspace_icon(page: &dyn Page, timings: &Timings, log: &mut RunLog) -> bool {
    log.info("Looking for the workspace icon");
    for raw in WORKSPACE_ICON_SELECTORS {
        let selector = Selector::from(raw);
        let Ok(icon) = page.wait_for_selector(&selector, timings.icon_timeout).await else {
            debug!(%selector, "workspace icon selector missed");
            continue;
        };
        match page.click(&icon).await {
            Ok(()) => {
                log.milestone(
                    Milestone::WorkspaceIconClicked,
                    Outcome::Success,
                    format!("Clicked the workspace icon via {raw}"),
                );
                return true;
            }
            Err(e) => log.info(format!("Direct click failed ({e}), trying a scripted click")),
        }
        match page.js_click(&icon).await {
            Ok(()) => {
                log.milestone(
                    Milestone::WorkspaceIconClicked,
                    Outcome::Success,
                    format!("Clicked the workspace icon via script ({raw})"),
                );
                return true;
            }
            Err(e) => log.info(format!("Scripted click failed: {e}")),
        }
    }
    log.warn("No workspace icon selector worked");
    false
}

/// Clicks into the workspace and watches the address for a change.
///
/// The app is a single-page application, so an unchanged address after a
/// reload is not proof of failure; that case proceeds as [`Certainty::Assumed`].
#[instrument(level = "debug", skip_all)]
pub async fn navigate_via_workspace_icon(
    page: &dyn Page,
    timings: &Timings,
    log: &mut RunLog,
) -> Confirmation {
    let before = page.url().await.unwrap_or_default();
    log.info(format!("URL before clicking: {before}"));

    if !click_workspace_icon(page, timings, log).await {
        log.warn("Could not click the workspace icon, navigation failed");
        return Confirmation::refused();
    }

    for check in 1..=3 {
        tokio::time::sleep(timings.url_poll_interval).await;
        let now = page.url().await.unwrap_or_default();
        log.info(format!("URL after clicking (check {check}/3): {now}"));
        if now != before {
            log.info("URL changed, waiting for the workspace to load");
            return Confirmation::confirmed();
        }
    }

    log.info("URL unchanged after clicking, reloading");
    if let Err(e) = page.reload().await {
        log.warn(format!("Reload failed: {e}"));
    }
    tokio::time::sleep(timings.page_settle).await;
    let after = page.url().await.unwrap_or_default();
    log.info(format!("URL after reload: {after}"));
    if after != before {
        log.info("URL changed after reload, waiting for the workspace to load");
        Confirmation::confirmed()
    } else {
        log.info("URL still unchanged, continuing to the workspace anyway");
        Confirmation::assumed()
    }
}

/// Whether an address looks like the workstation or its IDE.
pub fn is_workspace_address(url: &str, base_prefix: &str) -> bool {
    let lower = url.to_lowercase();
    let compact_prefix = base_prefix.replace('-', "").to_lowercase();
    url.contains("cloudworkstations.dev")
        || url.contains("workspace")
        || url.contains("firebase")
        || (!compact_prefix.is_empty() && lower.contains(&compact_prefix))
        || lower.contains("lost")
}

/// What to do after one readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Every marker present
    Complete,
    /// Enough markers present
    Sufficient,
    /// Too few markers; reload and probe again
    Reload,
    /// Too few markers and no probes left
    Exhausted,
}

/// Readiness policy for `found` of `total` markers on probe `probe` of `max_probes`.
pub fn assess(found: usize, total: usize, probe: u32, max_probes: u32) -> ProbeVerdict {
    if found >= total {
        ProbeVerdict::Complete
    } else if found >= MIN_READY_MARKERS.min(total) {
        ProbeVerdict::Sufficient
    } else if probe < max_probes {
        ProbeVerdict::Reload
    } else {
        ProbeVerdict::Exhausted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadinessState {
    CheckAddress,
    AwaitLoad,
    Bootstrap,
    Probe(u32),
    Reload(u32),
    Done(Readiness),
}

/// Polls the IDE until enough of its chrome is on screen.
pub struct ReadinessDetector<'a> {
    page: &'a dyn Page,
    base_prefix: &'a str,
    timings: &'a Timings,
    markers: Vec<Selector>,
}

impl<'a> ReadinessDetector<'a> {
    pub fn new(page: &'a dyn Page, config: &'a Config) -> Self {
        Self {
            page,
            base_prefix: &config.base_prefix,
            timings: &config.timings,
            markers: READINESS_MARKERS.iter().map(|m| Selector::from(*m)).collect(),
        }
    }

    #[instrument(level = "debug", skip_all)]
    pub async fn run(&self, log: &mut RunLog) -> Readiness {
        let mut state = ReadinessState::CheckAddress;
        loop {
            state = match state {
                ReadinessState::Done(readiness) => return readiness,
                other => self.step(other, log).await,
            };
        }
    }

    async fn step(&self, state: ReadinessState, log: &mut RunLog) -> ReadinessState {
        match state {
            ReadinessState::CheckAddress => {
                let url = self.page.url().await.unwrap_or_default();
                log.info(format!("Checking whether the workspace opened, URL: {url}"));
                if is_workspace_address(&url, self.base_prefix) {
                    log.info("URL matches the workspace, waiting for it to load");
                    ReadinessState::AwaitLoad
                } else {
                    log.warn("URL does not look like the workspace");
                    ReadinessState::Done(Readiness::not_reached())
                }
            }
            ReadinessState::AwaitLoad => {
                match self
                    .page
                    .wait_for_load_state(LoadState::DomContentLoaded, self.timings.dom_ready_timeout)
                    .await
                {
                    Ok(()) => log.info("DOM content loaded"),
                    Err(e) => log.info(format!("DOM load wait ended early ({e}), continuing")),
                }
                match self
                    .page
                    .wait_for_load_state(
                        LoadState::NetworkIdle,
                        self.timings.workspace_network_idle_timeout,
                    )
                    .await
                {
                    Ok(()) => log.info("Network is idle"),
                    Err(e) => log.info(format!("Network did not settle ({e}), continuing")),
                }
                ReadinessState::Bootstrap
            }
            ReadinessState::Bootstrap => {
                log.info(format!(
                    "Giving the IDE {:?} to bootstrap",
                    self.timings.bootstrap_pause
                ));
                tokio::time::sleep(self.timings.bootstrap_pause).await;
                ReadinessState::Probe(1)
            }
            ReadinessState::Probe(n) => {
                let total = self.markers.len();
                let found = match self.count_markers(log).await {
                    Ok(found) => found,
                    Err(e) => {
                        log.warn(format!("Probe {n} failed: {e}"));
                        0
                    }
                };
                log.info(format!(
                    "Found {found}/{total} IDE markers (probe {n}/{MAX_READINESS_PROBES})"
                ));
                match assess(found, total, n, MAX_READINESS_PROBES) {
                    ProbeVerdict::Complete => {
                        log.info("All IDE markers present, lingering before saving");
                        tokio::time::sleep(self.timings.full_ready_linger).await;
                        ReadinessState::Done(Readiness {
                            reached: true,
                            certainty: Certainty::Confirmed,
                            markers: found,
                        })
                    }
                    ProbeVerdict::Sufficient => {
                        log.info("Most IDE markers present, treating the workspace as loaded");
                        ReadinessState::Done(Readiness {
                            reached: true,
                            certainty: Certainty::Partial,
                            markers: found,
                        })
                    }
                    ProbeVerdict::Reload => ReadinessState::Reload(n),
                    ProbeVerdict::Exhausted => {
                        log.warn(format!(
                            "Too few IDE markers after {MAX_READINESS_PROBES} probes; the workspace address was reached, so continuing"
                        ));
                        ReadinessState::Done(Readiness {
                            reached: true,
                            certainty: Certainty::Assumed,
                            markers: found,
                        })
                    }
                }
            }
            ReadinessState::Reload(n) => {
                log.info(format!(
                    "Reloading the workspace ({n}/{MAX_READINESS_PROBES}) and waiting {:?}",
                    self.timings.reload_settle
                ));
                if let Err(e) = self.page.reload().await {
                    log.warn(format!("Reload failed: {e}"));
                }
                tokio::time::sleep(self.timings.reload_settle).await;
                ReadinessState::Probe(n + 1)
            }
            ReadinessState::Done(readiness) => ReadinessState::Done(readiness),
        }
    }

    /// Counts readiness markers in the IDE frame, or the page when no frame
    /// carries the IDE.
    async fn count_markers(&self, log: &mut RunLog) -> Result<usize, crate::AutomationError> {
        let frames = self.page.frames().await?;
        let mut target: &dyn Frame = self.page.as_frame();
        for frame in &frames {
            match frame.content().await {
                Ok(html) if html.contains(IDE_FRAME_MARKER) => {
                    log.info("Switched to the frame hosting the IDE");
                    target = frame.as_ref();
                    break;
                }
                Ok(_) => {}
                Err(e) => debug!(error = %e, "could not read frame content"),
            }
        }

        let mut found = 0;
        for marker in &self.markers {
            match target
                .wait_for_selector(marker, self.timings.marker_timeout)
                .await
            {
                Ok(_) => {
                    found += 1;
                    log.info(format!("Found marker {found}/{}: {marker}", self.markers.len()));
                }
                Err(e) => log.info(format!("Marker missing: {marker} ({e})")),
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_policy() {
        assert_eq!(assess(5, 5, 1, 3), ProbeVerdict::Complete);
        assert_eq!(assess(4, 5, 1, 3), ProbeVerdict::Sufficient);
        assert_eq!(assess(4, 5, 3, 3), ProbeVerdict::Sufficient);
        assert_eq!(assess(3, 5, 1, 3), ProbeVerdict::Reload);
        assert_eq!(assess(0, 5, 2, 3), ProbeVerdict::Reload);
        assert_eq!(assess(3, 5, 3, 3), ProbeVerdict::Exhausted);
    }

    #[test]
    fn workspace_addresses_are_recognised() {
        let prefix = "9000-idx-sherry-";
        assert!(is_workspace_address(
            "https://9000-idx-sherry-1.cluster-x.cloudworkstations.dev/",
            prefix
        ));
        assert!(is_workspace_address("https://studio.firebase.google.com/p", prefix));
        assert!(is_workspace_address("https://idx.google.com/workspace/abc", prefix));
        assert!(is_workspace_address("https://example.com/9000IDXSHERRY", prefix));
        assert!(!is_workspace_address("https://idx.google.com/", prefix));
        assert!(!is_workspace_address("https://idx.google.com/", ""));
    }

    #[test]
    fn strict_mode_rejects_assumptions() {
        assert!(Confirmation::assumed().accepted(false));
        assert!(!Confirmation::assumed().accepted(true));
        assert!(Confirmation::confirmed().accepted(true));
        assert!(!Confirmation::refused().accepted(false));

        let partial = Readiness {
            reached: true,
            certainty: Certainty::Partial,
            markers: 4,
        };
        assert!(partial.accepted(true));
    }

    #[test]
    fn markers_parse_into_alternatives() {
        for raw in READINESS_MARKERS {
            assert!(matches!(Selector::from(raw), Selector::Any { .. }), "{raw}");
        }
    }
}
