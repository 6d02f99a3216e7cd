use serde::{Deserialize, Serialize};

/// Represents ways to locate an element inside a remote document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum Selector {
    /// Select by CSS selector
    Css(String),
    /// Select using an XPath expression
    XPath(String),
    /// Select by the `id` attribute
    Id(String),
    /// Select by the `name` attribute
    Name(String),
    /// Select a link by its exact text
    LinkText(String),
    /// Select a link whose text contains the value
    PartialLinkText(String),
    /// Select by a single class name
    ClassName(String),
    /// Represents an invalid selector string, with a reason.
    Invalid(String),
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Css(v) => write!(f, "css:{v}"),
            Selector::XPath(v) => write!(f, "xpath:{v}"),
            Selector::Id(v) => write!(f, "id:{v}"),
            Selector::Name(v) => write!(f, "name:{v}"),
            Selector::LinkText(v) => write!(f, "link:{v}"),
            Selector::PartialLinkText(v) => write!(f, "partial-link:{v}"),
            Selector::ClassName(v) => write!(f, "class:{v}"),
            Selector::Invalid(reason) => write!(f, "invalid:{reason}"),
        }
    }
}

impl Selector {
    /// WebDriver `(using, value)` pair for the element-finding endpoints.
    ///
    /// Id, name and class selectors are expressed as CSS attribute selectors so
    /// values containing CSS metacharacters stay literal.
    pub fn to_webdriver(&self) -> Option<(&'static str, String)> {
        match self {
            Selector::Css(v) => Some(("css selector", v.clone())),
            Selector::XPath(v) => Some(("xpath", v.clone())),
            Selector::Id(v) => Some(("css selector", format!("[id=\"{}\"]", escape_quotes(v)))),
            Selector::Name(v) => Some((
                "css selector",
                format!("[name=\"{}\"]", escape_quotes(v)),
            )),
            Selector::LinkText(v) => Some(("link text", v.clone())),
            Selector::PartialLinkText(v) => Some(("partial link text", v.clone())),
            Selector::ClassName(v) => Some((
                "css selector",
                format!("[class~=\"{}\"]", escape_quotes(v)),
            )),
            Selector::Invalid(_) => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Selector::Invalid(_))
    }
}

fn escape_quotes(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    match s.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => Some(&s[prefix.len()..]),
        _ => None,
    }
}

impl From<&str> for Selector {
    fn from(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() {
            return Selector::Invalid("empty selector".to_string());
        }

        // Longest prefixes first so "partial-link:" is not read as "link:"
        if let Some(rest) = strip_prefix_ci(s, "partial-link:") {
            return Selector::PartialLinkText(rest.trim().to_string());
        }
        if let Some(rest) = strip_prefix_ci(s, "link:") {
            return Selector::LinkText(rest.trim().to_string());
        }
        if let Some(rest) = strip_prefix_ci(s, "xpath:") {
            return Selector::XPath(rest.trim().to_string());
        }
        if let Some(rest) = strip_prefix_ci(s, "css:") {
            return Selector::Css(rest.trim().to_string());
        }
        if let Some(rest) = strip_prefix_ci(s, "id:") {
            return Selector::Id(rest.trim().to_string());
        }
        if let Some(rest) = strip_prefix_ci(s, "name:") {
            return Selector::Name(rest.trim().to_string());
        }
        if let Some(rest) = strip_prefix_ci(s, "class:") {
            return Selector::ClassName(rest.trim().to_string());
        }

        if s.starts_with('/') || s.starts_with('(') {
            Selector::XPath(s.to_string())
        } else {
            Selector::Css(s.to_string())
        }
    }
}

impl From<String> for Selector {
    fn from(s: String) -> Self {
        Selector::from(s.as_str())
    }
}
