//! Durable browser session state.
//!
//! The file uses the Playwright `storage_state` layout so existing
//! `cookie.json` files keep working:
//!
//! ```json
//! { "cookies": [ { "name": "...", "value": "...", "domain": "...", "path": "/" } ],
//!   "origins": [ { "origin": "https://...", "localStorage": [ { "name": "k", "value": "v" } ] } ] }
//! ```

use crate::record::RunLog;
use crate::AutomationError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Cookie carrying the workstation bearer token.
pub const WORKSTATION_TOKEN_COOKIE: &str = "WorkstationJwtPartitioned";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub origins: Vec<OriginState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// Unix seconds; `-1` marks a session cookie.
    #[serde(default = "session_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
    /// Fields written by other tools are carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_path() -> String {
    "/".to_string()
}

fn session_expiry() -> f64 {
    -1.0
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_path(),
            expires: session_expiry(),
            http_only: false,
            secure: false,
            same_site: None,
            extra: Map::new(),
        }
    }

    /// Cookies are identified by (name, domain, path).
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.name, &self.domain, &self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginState {
    pub origin: String,
    #[serde(rename = "localStorage", default)]
    pub local_storage: Vec<StorageEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub name: String,
    pub value: String,
}

impl SessionState {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.origins.is_empty()
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// The workstation bearer token, if the session holds one.
    pub fn workstation_token(&self) -> Option<&str> {
        self.cookie(WORKSTATION_TOKEN_COOKIE)
            .map(|c| c.value.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Validates raw file content. `cookies` must be a list; a missing or
    /// malformed `origins` is normalized to an empty list. Entries that do not
    /// deserialize are dropped with a warning, keeping the rest of the session.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))?;
        let Value::Object(mut object) = value else {
            return Err("top level is not an object".to_string());
        };
        let cookies = match object.remove("cookies") {
            Some(Value::Array(cookies)) => cookies,
            Some(_) => return Err("`cookies` is not a list".to_string()),
            None => return Err("`cookies` is missing".to_string()),
        };
        let origins = match object.remove("origins") {
            Some(Value::Array(origins)) => origins,
            _ => Vec::new(),
        };
        Ok(Self {
            cookies: keep_valid(cookies, "cookie"),
            origins: keep_valid(origins, "origin"),
        })
    }
}

fn keep_valid<T: DeserializeOwned>(entries: Vec<Value>, kind: &str) -> Vec<T> {
    entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(index, error = %e, "Skipping malformed {kind} entry");
                None
            }
        })
        .collect()
}

/// Loads and persists [`SessionState`] at a fixed path.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored session. Anything unusable on disk is replaced by an
    /// empty session, which is written back so the file is valid afterwards.
    pub fn load(&self, log: &mut RunLog) -> SessionState {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log.info(format!(
                    "{} does not exist, creating an empty session file",
                    self.path.display()
                ));
                return self.reset(log);
            }
            Err(e) => {
                log.warn(format!("Failed to read {}: {e}", self.path.display()));
                return self.reset(log);
            }
        };

        match SessionState::parse(&raw) {
            Ok(state) => {
                log.info(format!(
                    "Loaded {} ({} cookies, {} origins)",
                    self.path.display(),
                    state.cookies.len(),
                    state.origins.len()
                ));
                state
            }
            Err(reason) => {
                log.warn(format!(
                    "{} is malformed ({reason}), resetting it",
                    self.path.display()
                ));
                self.reset(log)
            }
        }
    }

    /// Reads the file without repairing it. Used for reporting only.
    pub fn read_existing(&self) -> Option<SessionState> {
        let raw = fs::read_to_string(&self.path).ok()?;
        SessionState::parse(&raw).ok()
    }

    /// Replaces the file wholesale.
    pub fn save(&self, state: &SessionState) -> Result<(), AutomationError> {
        let json = serde_json::to_string_pretty(state)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), cookies = state.cookies.len(), "Session saved");
        Ok(())
    }

    fn reset(&self, log: &mut RunLog) -> SessionState {
        let empty = SessionState::empty();
        if let Err(e) = self.save(&empty) {
            log.warn(format!(
                "Could not write an empty session to {}: {e}",
                self.path.display()
            ));
        }
        empty
    }
}
