//! Workstation address derivation from the bearer token.
//!
//! The token is JWT-shaped; only its payload is read. The `aud` claim names
//! the workstation host, e.g. `idx-sherry-1745752283749.cluster-abc.cloudworkstations.dev`.
//! The host prefix in the claim is discarded in favour of the configured one.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::config::Config;
use crate::probe::PROBE_HEADERS;
use crate::record::RunLog;
use crate::session::{SessionStore, WORKSTATION_TOKEN_COOKIE};

const DEFAULT_CLUSTER: &str = "1745752283749.cluster-ikxjzjhlifcwuroomfkjrx437g.cloudworkstations.dev";

/// Characters of the token shown at each end of the masked form.
const TOKEN_VISIBLE: usize = 20;

static WORKSTATION_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([^.]+\.cluster-[^.]+\.cloudworkstations\.dev)").expect("valid host regex")
});

static CLUSTER_PART: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+\.cluster-[^.]+\.cloudworkstations\.dev)").expect("valid cluster regex")
});

/// Fallback address used whenever the token yields nothing usable.
pub fn default_workstation_url(prefix: &str) -> String {
    format!("https://{prefix}{DEFAULT_CLUSTER}")
}

/// Decodes the payload segment of a dot-separated token.
fn decode_payload(token: &str) -> Result<Value, String> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next()) {
        (Some(_), Some(payload)) if !payload.is_empty() => payload,
        _ => return Err("token has no payload segment".to_string()),
    };
    let mut padded = payload.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    let bytes = URL_SAFE
        .decode(&padded)
        .or_else(|_| STANDARD.decode(&padded))
        .map_err(|e| format!("payload is not base64: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("payload is not JSON: {e}"))
}

/// Derives `https://{prefix}{cluster}` from the token's `aud` claim.
/// Returns `None` when any step fails; the reason is logged.
pub fn derive_workstation_url(token: &str, prefix: &str, log: &mut RunLog) -> Option<String> {
    let payload = match decode_payload(token) {
        Ok(payload) => payload,
        Err(reason) => {
            log.warn(format!("Could not decode workstation token: {reason}"));
            return None;
        }
    };
    let Some(aud) = payload.get("aud").and_then(Value::as_str) else {
        log.warn("Workstation token has no `aud` claim");
        return None;
    };
    log.info(format!("Token audience: {aud}"));

    let Some(host) = WORKSTATION_HOST.captures(aud).and_then(|c| c.get(1)) else {
        log.warn("Token audience is not a workstation host");
        return None;
    };
    let host = host.as_str();

    match CLUSTER_PART.captures(host).and_then(|c| c.get(1)) {
        Some(cluster) => {
            let url = format!("https://{prefix}{}", cluster.as_str());
            log.info(format!("Workstation URL (configured prefix): {url}"));
            Some(url)
        }
        None => {
            let url = format!("https://{host}");
            log.info(format!("Workstation URL (cluster part not found, using host as-is): {url}"));
            Some(url)
        }
    }
}

/// Resolves the workstation base URL. Never fails.
///
/// An explicitly configured URL wins. Otherwise the token is taken from the
/// argument or, when absent, from the session file.
pub fn resolve_workstation_url(
    token: Option<&str>,
    config: &Config,
    store: &SessionStore,
    log: &mut RunLog,
) -> String {
    if let Some(url) = &config.workstation_url {
        log.info(format!("Using configured workstation URL {url}"));
        return url.clone();
    }

    let stored;
    let token = match token {
        Some(token) => Some(token),
        None => {
            stored = store.read_existing();
            stored.as_ref().and_then(|s| s.workstation_token())
        }
    };

    let derived = match token {
        Some(token) => derive_workstation_url(token, &config.base_prefix, log),
        None => {
            log.info("No workstation token available");
            None
        }
    };
    derived.unwrap_or_else(|| {
        let url = default_workstation_url(&config.base_prefix);
        log.info(format!("Using default workstation URL {url}"));
        url
    })
}

/// `abcdefghij...uvwxyz` style rendering of a secret token.
pub fn mask_token(token: &str) -> String {
    let count = token.chars().count();
    if count <= TOKEN_VISIBLE * 2 {
        let head: String = token.chars().take(count / 2).collect();
        return format!("{head}...");
    }
    let head: String = token.chars().take(TOKEN_VISIBLE).collect();
    let tail: String = token.chars().skip(count - TOKEN_VISIBLE).collect();
    format!("{head}...{tail}")
}

/// A shell command that reproduces the reachability probe.
pub fn curl_example(url: &str, token: &str) -> String {
    let mut command = String::from("curl -sS -o /dev/null -w '%{http_code}\\n'");
    for (name, value) in PROBE_HEADERS {
        command.push_str(&format!(" \\\n  -H '{name}: {value}'"));
    }
    command.push_str(&format!(" \\\n  -b '{WORKSTATION_TOKEN_COOKIE}={token}'"));
    command.push_str(&format!(" \\\n  '{url}'"));
    command
}

/// Logs the stored token (masked), the derived address and a ready-to-run
/// request. Missing file or token is logged and skipped.
pub fn describe_credentials(config: &Config, store: &SessionStore, log: &mut RunLog) {
    let Some(state) = store.read_existing() else {
        log.info(format!(
            "{} is missing or unreadable, no credentials to show",
            store.path().display()
        ));
        return;
    };
    let Some(token) = state.workstation_token() else {
        log.info(format!("No {WORKSTATION_TOKEN_COOKIE} cookie in {}", store.path().display()));
        return;
    };

    let url = resolve_workstation_url(Some(token), config, store, log);
    log.info("========== Workstation credentials ==========");
    log.info(format!(
        "{WORKSTATION_TOKEN_COOKIE}: {} (first and last {TOKEN_VISIBLE} characters)",
        mask_token(token)
    ));
    log.info(format!("Workstation URL: {url}"));
    log.info(format!("Reproduce the probe with:\n{}", curl_example(&url, token)));
    log.info("=============================================");
}
