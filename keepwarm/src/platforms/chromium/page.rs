use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::cdp_client::CdpConnection;
use crate::platforms::{ElementHandle, Frame, LoadState, Page};
use crate::session::{Cookie, OriginState, SessionState, StorageEntry};
use crate::{AutomationError, Selector};

/// Attribute used to tag elements returned from lookups
pub(crate) const HANDLE_ATTR: &str = "data-keepwarm-handle";

/// Budget for plain protocol round trips
const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);
const RELOAD_TIMEOUT: Duration = Duration::from_secs(30);
const LOAD_POLL: Duration = Duration::from_millis(100);
const NETWORK_QUIET: Duration = Duration::from_millis(500);

/// Finds the first visible element matching a serialized selector, tags it
/// and returns its handle. Returns `null` when nothing matches.
const FIND_SCRIPT: &str = r#"(spec, handle) => {
  const ATTR = 'data-keepwarm-handle';
  const norm = (s) => (s || '').replace(/\s+/g, ' ').trim();
  const textOf = (el) => norm(el.innerText || el.textContent);
  const all = (css) => { try { return Array.from(document.querySelectorAll(css)); } catch (e) { return []; } };
  const visible = (el) => {
    const style = window.getComputedStyle(el);
    if (style.visibility === 'hidden' || style.display === 'none') return false;
    const rect = el.getBoundingClientRect();
    return rect.width > 0 && rect.height > 0;
  };
  const deepest = (els) => els.filter((el) => !els.some((other) => other !== el && el.contains(other)));
  const labelled = (label) => {
    const want = norm(label);
    const direct = all('[aria-label]').filter((el) => norm(el.getAttribute('aria-label')) === want);
    const viaLabel = all('label').filter((l) => textOf(l) === want)
      .map((l) => l.control || (l.htmlFor ? document.getElementById(l.htmlFor) : null))
      .filter(Boolean);
    const viaRef = all('[aria-labelledby]').filter((el) => el.getAttribute('aria-labelledby')
      .split(/\s+/).map((id) => document.getElementById(id)).filter(Boolean)
      .map(textOf).join(' ') === want);
    return direct.concat(viaLabel, viaRef);
  };
  const IMPLICIT = {
    button: 'button, input[type="button"], input[type="submit"], [role="button"]',
    link: 'a[href], [role="link"]',
    textbox: 'input:not([type]), input[type="text"], input[type="email"], textarea, [role="textbox"]',
  };
  const nameOf = (el) => norm(el.getAttribute('aria-label') || el.innerText || el.value || el.getAttribute('title'));
  const candidates = (s) => {
    switch (s.kind) {
      case 'css': return all(s.css);
      case 'text': return deepest(all('body *').filter((el) => textOf(el) === norm(s.text)));
      case 'has_text': return deepest(all(s.css).filter((el) => textOf(el).includes(norm(s.text))));
      case 'label': return labelled(s.label);
      case 'role': {
        const els = all(IMPLICIT[s.role] || `[role="${s.role}"]`);
        return s.name == null ? els : els.filter((el) => nameOf(el) === norm(s.name));
      }
      case 'any': {
        for (const alt of s.alternatives) {
          const found = candidates(alt).filter(visible);
          if (found.length) return found;
        }
        return [];
      }
      default: return [];
    }
  };
  const el = candidates(spec).find(visible);
  if (!el) return null;
  if (!el.hasAttribute(ATTR)) el.setAttribute(ATTR, handle);
  return el.getAttribute(ATTR);
}"#;

const FILL_SCRIPT: &str = r#"(el, value) => {
  if (!el) return false;
  el.focus();
  const proto = el instanceof HTMLTextAreaElement ? HTMLTextAreaElement.prototype : HTMLInputElement.prototype;
  const descriptor = Object.getOwnPropertyDescriptor(proto, 'value');
  if (descriptor && descriptor.set && (el instanceof HTMLInputElement || el instanceof HTMLTextAreaElement)) {
    descriptor.set.call(el, value);
  } else {
    el.textContent = value;
  }
  el.dispatchEvent(new Event('input', { bubbles: true }));
  el.dispatchEvent(new Event('change', { bubbles: true }));
  return true;
}"#;

const STORAGE_SCRIPT: &str = r#"(() => {
  try {
    const items = Object.keys(window.localStorage)
      .map((name) => ({ name, value: window.localStorage.getItem(name) || '' }));
    return { origin: window.location.origin, items };
  } catch (e) {
    return { origin: window.location.origin, items: [] };
  }
})()"#;

fn element_expr(handle: &ElementHandle) -> String {
    format!("document.querySelector('[{HANDLE_ATTR}=\"{}\"]')", handle.id)
}

/// A document reachable through one execution context.
pub struct ChromiumFrame {
    conn: Arc<CdpConnection>,
    /// `None` evaluates in the page's default context.
    context: Option<i64>,
}

impl ChromiumFrame {
    pub(crate) fn new(conn: Arc<CdpConnection>, context: Option<i64>) -> Self {
        Self { conn, context }
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, AutomationError> {
        evaluate_in(&self.conn, self.context, expression).await
    }
}

async fn evaluate_in(
    conn: &CdpConnection,
    context: Option<i64>,
    expression: &str,
) -> Result<Value, AutomationError> {
    let mut params = json!({
        "expression": expression,
        "returnByValue": true,
        "awaitPromise": true,
    });
    if let Some(id) = context {
        params["contextId"] = json!(id);
    }
    let response = conn.call("Runtime.evaluate", params, COMMAND_TIMEOUT).await?;
    if let Some(details) = response.get("exceptionDetails") {
        let text = details
            .pointer("/exception/description")
            .or_else(|| details.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("script threw");
        return Err(AutomationError::Protocol(format!("evaluation failed: {text}")));
    }
    Ok(response
        .pointer("/result/value")
        .cloned()
        .unwrap_or(Value::Null))
}

#[async_trait::async_trait]
impl Frame for ChromiumFrame {
    async fn content(&self) -> Result<String, AutomationError> {
        let value = self
            .evaluate("document.documentElement ? document.documentElement.outerHTML : ''")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn query(&self, selector: &Selector) -> Result<Option<ElementHandle>, AutomationError> {
        if !selector.is_valid() {
            return Err(AutomationError::InvalidSelector(selector.to_string()));
        }
        let spec = serde_json::to_string(selector)?;
        let fresh = serde_json::to_string(&uuid::Uuid::new_v4().to_string())?;
        let value = self
            .evaluate(&format!("({FIND_SCRIPT})({spec}, {fresh})"))
            .await?;
        Ok(value.as_str().map(|id| ElementHandle {
            id: id.to_string(),
            context: self.context,
            selector: selector.clone(),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct Rect {
    x: f64,
    y: f64,
    w: f64,
    h: f64,
}

#[derive(Debug, Deserialize)]
struct LocalStorageDump {
    origin: String,
    #[serde(default)]
    items: Vec<StorageEntry>,
}

/// A single key press as the protocol expects it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct KeyStroke {
    pub key: String,
    pub code: String,
    pub key_code: i64,
    pub text: Option<String>,
    pub modifiers: i64,
    pub commands: Vec<&'static str>,
}

/// Parses chords such as `Enter`, `Delete` or `Control+a`.
pub(crate) fn parse_chord(chord: &str) -> Result<KeyStroke, AutomationError> {
    let mut parts: Vec<&str> = chord.split('+').collect();
    let key = parts
        .pop()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| AutomationError::InvalidArgument(format!("empty key chord: {chord:?}")))?;

    let mut modifiers = 0;
    for modifier in parts {
        modifiers |= match modifier {
            "Alt" => 1,
            "Control" | "Ctrl" => 2,
            "Meta" | "Command" => 4,
            "Shift" => 8,
            other => {
                return Err(AutomationError::InvalidArgument(format!(
                    "unknown modifier {other:?} in {chord:?}"
                )))
            }
        };
    }

    let (code, key_code, text): (String, i64, Option<String>) = match key {
        "Enter" => ("Enter".into(), 13, Some("\r".into())),
        "Tab" => ("Tab".into(), 9, None),
        "Backspace" => ("Backspace".into(), 8, None),
        "Delete" => ("Delete".into(), 46, None),
        "Escape" => ("Escape".into(), 27, None),
        single if single.chars().count() == 1 => {
            let ch = single.chars().next().unwrap_or(' ');
            let upper = ch.to_ascii_uppercase();
            let code = if ch.is_ascii_alphabetic() {
                format!("Key{upper}")
            } else if ch.is_ascii_digit() {
                format!("Digit{ch}")
            } else {
                String::new()
            };
            (code, upper as i64, Some(single.to_string()))
        }
        other => {
            return Err(AutomationError::InvalidArgument(format!(
                "unsupported key {other:?}"
            )))
        }
    };

    // Shortcuts with Control or Meta produce no text
    let text = if modifiers & (2 | 4) != 0 { None } else { text };
    let commands = match (modifiers & (2 | 4) != 0, key) {
        (true, "a") | (true, "A") => vec!["selectAll"],
        _ => Vec::new(),
    };

    Ok(KeyStroke {
        key: key.to_string(),
        code,
        key_code,
        text,
        modifiers,
        commands,
    })
}

/// The single tab of a launched browser. Owns the browser process.
pub struct ChromiumPage {
    main: ChromiumFrame,
    conn: Arc<CdpConnection>,
    browser: Mutex<Option<Child>>,
    profile: std::sync::Mutex<Option<TempDir>>,
    /// Local storage restored at launch, kept so a save does not drop origins
    /// that were never visited during the run.
    seeded_origins: Vec<OriginState>,
}

impl ChromiumPage {
    pub(crate) fn new(
        conn: Arc<CdpConnection>,
        browser: Child,
        profile: TempDir,
        seeded_origins: Vec<OriginState>,
    ) -> Self {
        Self {
            main: ChromiumFrame::new(conn.clone(), None),
            conn,
            browser: Mutex::new(Some(browser)),
            profile: std::sync::Mutex::new(Some(profile)),
            seeded_origins,
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, AutomationError> {
        self.conn.call(method, params, COMMAND_TIMEOUT).await
    }

    async fn evaluate_on(
        &self,
        element: &ElementHandle,
        body: &str,
    ) -> Result<Value, AutomationError> {
        let expression = format!("((el) => {{ if (!el) return null; {body} }})({})", element_expr(element));
        let value = evaluate_in(&self.conn, element.context, &expression).await?;
        if value.is_null() {
            return Err(AutomationError::ElementDetached(element.selector.to_string()));
        }
        Ok(value)
    }

    /// Scrolls the element into view and returns its centre in viewport
    /// coordinates.
    async fn centre_of(&self, element: &ElementHandle) -> Result<(f64, f64), AutomationError> {
        let value = self
            .evaluate_on(
                element,
                "el.scrollIntoView({ block: 'center', inline: 'center' }); \
                 const r = el.getBoundingClientRect(); \
                 return { x: r.left + r.width / 2, y: r.top + r.height / 2, w: r.width, h: r.height };",
            )
            .await?;
        let rect: Rect = serde_json::from_value(value)?;
        if rect.w <= 0.0 || rect.h <= 0.0 {
            return Err(AutomationError::Protocol(format!(
                "{} has no visible size",
                element.selector
            )));
        }
        Ok((rect.x, rect.y))
    }

    async fn mouse(&self, kind: &str, x: f64, y: f64) -> Result<(), AutomationError> {
        let mut params = json!({ "type": kind, "x": x, "y": y });
        if kind != "mouseMoved" {
            params["button"] = json!("left");
            params["clickCount"] = json!(1);
        }
        self.call("Input.dispatchMouseEvent", params).await?;
        Ok(())
    }

    async fn dispatch_key(&self, stroke: &KeyStroke) -> Result<(), AutomationError> {
        let down_type = if stroke.text.is_some() { "keyDown" } else { "rawKeyDown" };
        let mut down = json!({
            "type": down_type,
            "key": stroke.key,
            "code": stroke.code,
            "windowsVirtualKeyCode": stroke.key_code,
            "modifiers": stroke.modifiers,
        });
        if let Some(text) = &stroke.text {
            down["text"] = json!(text);
        }
        if !stroke.commands.is_empty() {
            down["commands"] = json!(stroke.commands);
        }
        self.call("Input.dispatchKeyEvent", down).await?;
        self.call(
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyUp",
                "key": stroke.key,
                "code": stroke.code,
                "windowsVirtualKeyCode": stroke.key_code,
                "modifiers": stroke.modifiers,
            }),
        )
        .await?;
        Ok(())
    }

    async fn ready_state(&self) -> Result<String, AutomationError> {
        let value = self.main.evaluate("document.readyState").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// Waits for `Page.loadEventFired` on an already subscribed receiver.
    async fn await_load_event(
        &self,
        events: &mut tokio::sync::broadcast::Receiver<super::cdp_client::CdpEvent>,
        timeout: Duration,
        what: &str,
    ) -> Result<(), AutomationError> {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(event) if event.method == "Page.loadEventFired" => return Ok(()),
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event receiver lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(AutomationError::Protocol("browser connection closed".into()))
                    }
                }
            }
        })
        .await;
        match waited {
            Ok(result) => result,
            Err(_) => Err(AutomationError::Timeout(format!(
                "{what} did not finish loading within {timeout:?}"
            ))),
        }
    }
}

#[async_trait::async_trait]
impl Frame for ChromiumPage {
    async fn content(&self) -> Result<String, AutomationError> {
        self.main.content().await
    }

    async fn query(&self, selector: &Selector) -> Result<Option<ElementHandle>, AutomationError> {
        self.main.query(selector).await
    }
}

#[async_trait::async_trait]
impl Page for ChromiumPage {
    fn as_frame(&self) -> &dyn Frame {
        &self.main
    }

    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), AutomationError> {
        let mut events = self.conn.subscribe();
        let result = self
            .conn
            .call("Page.navigate", json!({ "url": url }), timeout.max(COMMAND_TIMEOUT))
            .await?;
        if let Some(error) = result
            .get("errorText")
            .and_then(Value::as_str)
            .filter(|e| !e.is_empty())
        {
            return Err(AutomationError::Navigation(format!("{url}: {error}")));
        }
        // Same-document navigations carry no loader and fire no load event
        if result.get("loaderId").is_none() {
            return Ok(());
        }
        self.await_load_event(&mut events, timeout, url).await
    }

    async fn url(&self) -> Result<String, AutomationError> {
        let value = self.main.evaluate("window.location.href").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn reload(&self) -> Result<(), AutomationError> {
        let mut events = self.conn.subscribe();
        self.call("Page.reload", json!({})).await?;
        self.await_load_event(&mut events, RELOAD_TIMEOUT, "reload").await
    }

    async fn wait_for_load_state(
        &self,
        state: LoadState,
        timeout: Duration,
    ) -> Result<(), AutomationError> {
        let deadline = Instant::now() + timeout;
        loop {
            let reached = match state {
                LoadState::DomContentLoaded => {
                    matches!(self.ready_state().await?.as_str(), "interactive" | "complete")
                }
                LoadState::Load => self.ready_state().await? == "complete",
                LoadState::NetworkIdle => self.conn.network_quiet_for(NETWORK_QUIET),
            };
            if reached {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AutomationError::Timeout(format!(
                    "{state:?} not reached within {timeout:?}"
                )));
            }
            tokio::time::sleep(LOAD_POLL.min(deadline - now)).await;
        }
    }

    async fn frames(&self) -> Result<Vec<Box<dyn Frame>>, AutomationError> {
        let tree = self.call("Page.getFrameTree", json!({})).await?;
        let mut ids = Vec::new();
        if let Some(root) = tree.get("frameTree") {
            collect_child_frames(root, &mut ids);
        }

        let mut frames: Vec<Box<dyn Frame>> = Vec::with_capacity(ids.len());
        for frame_id in ids {
            let world = self
                .call(
                    "Page.createIsolatedWorld",
                    json!({ "frameId": frame_id, "worldName": "keepwarm", "grantUniveralAccess": true }),
                )
                .await;
            match world.map(|w| w.get("executionContextId").and_then(Value::as_i64)) {
                Ok(Some(context)) => {
                    frames.push(Box::new(ChromiumFrame::new(self.conn.clone(), Some(context))));
                }
                Ok(None) => debug!(%frame_id, "frame has no execution context"),
                Err(e) => debug!(%frame_id, error = %e, "skipping frame"),
            }
        }
        Ok(frames)
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), AutomationError> {
        // Frame-local coordinates cannot be mapped to the viewport here
        if element.context.is_some() {
            return self.js_click(element).await;
        }
        let (x, y) = self.centre_of(element).await?;
        self.mouse("mouseMoved", x, y).await?;
        self.mouse("mousePressed", x, y).await?;
        self.mouse("mouseReleased", x, y).await
    }

    async fn js_click(&self, element: &ElementHandle) -> Result<(), AutomationError> {
        self.evaluate_on(element, "el.click(); return true;").await?;
        Ok(())
    }

    async fn hover(&self, element: &ElementHandle) -> Result<(), AutomationError> {
        if element.context.is_some() {
            self.evaluate_on(
                element,
                "el.dispatchEvent(new MouseEvent('mouseover', { bubbles: true })); return true;",
            )
            .await?;
            return Ok(());
        }
        let (x, y) = self.centre_of(element).await?;
        self.mouse("mouseMoved", x, y).await
    }

    async fn focus(&self, element: &ElementHandle) -> Result<(), AutomationError> {
        self.evaluate_on(element, "el.focus(); return true;").await?;
        Ok(())
    }

    async fn press(&self, element: &ElementHandle, key: &str) -> Result<(), AutomationError> {
        let stroke = parse_chord(key)?;
        self.focus(element).await?;
        self.dispatch_key(&stroke).await
    }

    async fn type_text(
        &self,
        element: &ElementHandle,
        text: &str,
        delay: Duration,
    ) -> Result<(), AutomationError> {
        self.focus(element).await?;
        for ch in text.chars() {
            self.call("Input.insertText", json!({ "text": ch.to_string() }))
                .await?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    async fn fill(&self, element: &ElementHandle, text: &str) -> Result<(), AutomationError> {
        let value = serde_json::to_string(text)?;
        let expression = format!("({FILL_SCRIPT})({}, {value})", element_expr(element));
        match evaluate_in(&self.conn, element.context, &expression).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(AutomationError::ElementDetached(element.selector.to_string())),
        }
    }

    async fn storage_state(&self) -> Result<SessionState, AutomationError> {
        let response = self.call("Network.getAllCookies", json!({})).await?;
        let cookies = response
            .get("cookies")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(cookie_from_cdp).collect())
            .unwrap_or_default();

        let mut origins: Vec<OriginState> = self.seeded_origins.clone();
        match self.main.evaluate(STORAGE_SCRIPT).await {
            Ok(value) => {
                let dump: LocalStorageDump = serde_json::from_value(value)?;
                if dump.origin.starts_with("http") {
                    origins.retain(|o| o.origin != dump.origin);
                    if !dump.items.is_empty() {
                        origins.push(OriginState {
                            origin: dump.origin,
                            local_storage: dump.items,
                        });
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not read local storage"),
        }

        Ok(SessionState { cookies, origins })
    }

    async fn close(&self) -> Result<(), AutomationError> {
        let child = self.browser.lock().await.take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "browser already exited");
            }
        }
        if let Ok(mut profile) = self.profile.lock() {
            profile.take();
        }
        Ok(())
    }
}

fn collect_child_frames(node: &Value, out: &mut Vec<String>) {
    let Some(children) = node.get("childFrames").and_then(Value::as_array) else {
        return;
    };
    for child in children {
        if let Some(id) = child.pointer("/frame/id").and_then(Value::as_str) {
            out.push(id.to_string());
        }
        collect_child_frames(child, out);
    }
}

fn cookie_from_cdp(value: &Value) -> Option<Cookie> {
    let name = value.get("name")?.as_str()?;
    let cookie_value = value.get("value")?.as_str()?;
    let domain = value.get("domain").and_then(Value::as_str).unwrap_or_default();
    let mut cookie = Cookie::new(name, cookie_value, domain);
    if let Some(path) = value.get("path").and_then(Value::as_str) {
        cookie.path = path.to_string();
    }
    let session = value.get("session").and_then(Value::as_bool).unwrap_or(false);
    if let Some(expires) = value.get("expires").and_then(Value::as_f64) {
        cookie.expires = if session { -1.0 } else { expires };
    }
    cookie.http_only = value.get("httpOnly").and_then(Value::as_bool).unwrap_or(false);
    cookie.secure = value.get("secure").and_then(Value::as_bool).unwrap_or(false);
    cookie.same_site = value
        .get("sameSite")
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(cookie)
}

/// Protocol parameters for restoring one stored cookie. Cookies without a
/// domain cannot be set and yield `None`.
pub(crate) fn cookie_to_cdp(cookie: &Cookie) -> Option<Value> {
    if cookie.domain.is_empty() {
        return None;
    }
    let mut param = json!({
        "name": cookie.name,
        "value": cookie.value,
        "domain": cookie.domain,
        "path": cookie.path,
        "secure": cookie.secure,
        "httpOnly": cookie.http_only,
    });
    if cookie.expires > 0.0 {
        param["expires"] = json!(cookie.expires);
    }
    if let Some(same_site) = cookie
        .same_site
        .as_deref()
        .filter(|s| matches!(*s, "Strict" | "Lax" | "None"))
    {
        param["sameSite"] = json!(same_site);
    }
    Some(param)
}

/// Script restoring local storage for `origin` before any page script runs.
pub(crate) fn local_storage_seed(origin: &OriginState) -> Result<String, AutomationError> {
    let target = serde_json::to_string(&origin.origin)?;
    let entries = serde_json::to_string(&origin.local_storage)?;
    Ok(format!(
        "(() => {{ if (window.location.origin !== {target}) return; \
         try {{ for (const e of {entries}) {{ if (window.localStorage.getItem(e.name) === null) \
         window.localStorage.setItem(e.name, e.value); }} }} catch (err) {{}} }})()"
    ))
}
