use serde::Serialize;

/// Represents ways to locate an element on a page
///
/// Parsed from Playwright-style selector strings, e.g. `text="Choose an account"`,
/// `button:has-text("Next")`, `label:Email or phone`, `role:button|Next`, or
/// plain CSS. Comma-separated alternatives become [`Selector::Any`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selector {
    /// Plain CSS selector
    Css { css: String },
    /// Element whose visible text equals the value
    Text { text: String },
    /// CSS match whose visible text contains the value
    HasText { css: String, text: String },
    /// Form control labelled by the value (aria-label, `<label>`, aria-labelledby)
    Label { label: String },
    /// Element with an explicit or implicit ARIA role and optional accessible name
    Role { role: String, name: Option<String> },
    /// First alternative that matches wins
    Any { alternatives: Vec<Selector> },
    /// Represents an invalid selector string, with a reason.
    Invalid { reason: String },
}

impl Selector {
    pub fn css(css: impl Into<String>) -> Self {
        Selector::Css { css: css.into() }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Selector::Text { text: text.into() }
    }

    pub fn has_text(css: impl Into<String>, text: impl Into<String>) -> Self {
        Selector::HasText {
            css: css.into(),
            text: text.into(),
        }
    }

    pub fn label(label: impl Into<String>) -> Self {
        Selector::Label {
            label: label.into(),
        }
    }

    pub fn role(role: impl Into<String>, name: Option<&str>) -> Self {
        Selector::Role {
            role: role.into(),
            name: name.map(str::to_string),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Selector::Invalid { .. } => false,
            Selector::Any { alternatives } => alternatives.iter().all(Selector::is_valid),
            _ => true,
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Css { css } => write!(f, "{css}"),
            Selector::Text { text } => write!(f, "text=\"{text}\""),
            Selector::HasText { css, text } => write!(f, "{css}:has-text(\"{text}\")"),
            Selector::Label { label } => write!(f, "label:{label}"),
            Selector::Role { role, name: None } => write!(f, "role:{role}"),
            Selector::Role {
                role,
                name: Some(name),
            } => write!(f, "role:{role}|{name}"),
            Selector::Any { alternatives } => {
                let parts: Vec<String> = alternatives.iter().map(|s| s.to_string()).collect();
                write!(f, "{}", parts.join(", "))
            }
            Selector::Invalid { reason } => write!(f, "<invalid: {reason}>"),
        }
    }
}

impl From<&str> for Selector {
    fn from(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() {
            return Selector::Invalid {
                reason: "empty selector".to_string(),
            };
        }

        // Handle alternatives first
        let parts = split_top_level(s);
        if parts.len() > 1 {
            return Selector::Any {
                alternatives: parts.into_iter().map(Selector::from).collect(),
            };
        }

        if let Some(rest) = s.strip_prefix("text=") {
            return match unquote(rest) {
                Some(text) => Selector::text(text),
                None => Selector::Invalid {
                    reason: format!("unterminated text selector: {s}"),
                },
            };
        }

        if let Some(rest) = s.strip_prefix("label:") {
            return Selector::label(rest.trim());
        }

        // role:button|Next (preferred precise format), or role:button
        if let Some(rest) = s.strip_prefix("role:") {
            return match rest.split_once('|') {
                Some((role, name)) => Selector::role(
                    role.trim(),
                    Some(name.trim().strip_prefix("name:").unwrap_or(name.trim())),
                ),
                None => Selector::role(rest.trim(), None),
            };
        }

        if let Some(idx) = s.find(":has-text(") {
            let css = s[..idx].trim();
            let inner = s[idx + ":has-text(".len()..].trim_end();
            let Some(inner) = inner.strip_suffix(')') else {
                return Selector::Invalid {
                    reason: format!("unterminated :has-text in {s}"),
                };
            };
            return match unquote(inner) {
                Some(text) => Selector::has_text(if css.is_empty() { "*" } else { css }, text),
                None => Selector::Invalid {
                    reason: format!(":has-text expects a quoted string: {s}"),
                },
            };
        }

        Selector::css(s)
    }
}

impl From<String> for Selector {
    fn from(s: String) -> Self {
        Selector::from(s.as_str())
    }
}

/// Parses a list of selector strings, keeping their order.
pub fn selector_list(raw: &[&str]) -> Vec<Selector> {
    raw.iter().map(|s| Selector::from(*s)).collect()
}

/// Splits on commas that are outside quotes, brackets and parentheses.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[' | '(') => depth += 1,
            (None, ']' | ')') => depth -= 1,
            (None, ',') if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Strips one pair of matching quotes; bare text is accepted as-is.
fn unquote(s: &str) -> Option<String> {
    let s = s.trim();
    let first = s.chars().next()?;
    if first == '"' || first == '\'' {
        let inner = s.strip_prefix(first)?.strip_suffix(first)?;
        Some(inner.to_string())
    } else {
        Some(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_css_stays_css() {
        assert_eq!(
            Selector::from("input[type=\"email\"]"),
            Selector::css("input[type=\"email\"]")
        );
        assert_eq!(
            Selector::from("div.workspace-icon img.custom-icon"),
            Selector::css("div.workspace-icon img.custom-icon")
        );
    }

    #[test]
    fn text_selector_is_unquoted() {
        assert_eq!(
            Selector::from("text=\"Choose an account\""),
            Selector::text("Choose an account")
        );
        assert_eq!(Selector::from("text=Next"), Selector::text("Next"));
    }

    #[test]
    fn has_text_splits_css_and_text() {
        assert_eq!(
            Selector::from("[role=\"button\"]:has-text(\"下一步\")"),
            Selector::has_text("[role=\"button\"]", "下一步")
        );
        assert_eq!(
            Selector::from("a[href=\"/new\"] span:has-text(\"Get Started\")"),
            Selector::has_text("a[href=\"/new\"] span", "Get Started")
        );
    }

    #[test]
    fn commas_inside_attribute_values_do_not_split() {
        let sel = Selector::from("[aria-label=\"a, b\"]");
        assert_eq!(sel, Selector::css("[aria-label=\"a, b\"]"));
    }

    #[test]
    fn alternatives_become_any() {
        let sel = Selector::from(
            "div[aria-label=\"Web\"] span.tab-label-name, div[aria-label*=\"Web\"], span.monaco-icon-name-container:has-text(\"Web\")",
        );
        match sel {
            Selector::Any { alternatives } => {
                assert_eq!(alternatives.len(), 3);
                assert_eq!(
                    alternatives[2],
                    Selector::has_text("span.monaco-icon-name-container", "Web")
                );
            }
            other => panic!("expected Any, got {other:?}"),
        }
    }

    #[test]
    fn role_and_label_prefixes() {
        assert_eq!(
            Selector::from("role:button|Next"),
            Selector::role("button", Some("Next"))
        );
        assert_eq!(Selector::from("role:link"), Selector::role("link", None));
        assert_eq!(
            Selector::from("label:Email or phone"),
            Selector::label("Email or phone")
        );
    }

    #[test]
    fn malformed_input_is_invalid() {
        assert!(!Selector::from("").is_valid());
        assert!(!Selector::from("button:has-text(\"Next\"").is_valid());
        assert!(!Selector::from("text=\"open").is_valid());
    }

    #[test]
    fn display_round_trips_through_parser() {
        for raw in [
            "text=\"Choose an account\"",
            "button:has-text(\"Next\")",
            "role:button|Next",
            "label:Enter your password",
            ".workspace-icon",
        ] {
            let sel = Selector::from(raw);
            assert_eq!(Selector::from(sel.to_string().as_str()), sel, "{raw}");
        }
    }

    #[test]
    fn serializes_with_kind_tag() {
        let json = serde_json::to_value(Selector::has_text("button", "Next")).unwrap();
        assert_eq!(json["kind"], "has_text");
        assert_eq!(json["css"], "button");
        assert_eq!(json["text"], "Next");
    }
}
