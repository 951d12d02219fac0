//! Heuristic availability classification of fetched content.
//!
//! One pure function per check kind, dispatched through [`judge`], with a
//! keyword scan applied to every result as a safety net against malformed
//! selectors and patterns.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fetcher::blocked_marker;

/// Phrases that force an `unavailable` verdict wherever they appear in the
/// page, regardless of what the primary check concluded.
pub const OUT_OF_STOCK_KEYWORDS: &[&str] = &[
    "out of stock",
    "sold out",
    "no stock",
    "缺货",
    "缺貨中",
    "无货",
    "已售罄",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Available,
    Unavailable,
    Indeterminate,
}

impl Availability {
    /// Human wording used in notification messages.
    pub fn label(&self) -> &'static str {
        match self {
            Availability::Available => "in stock",
            Availability::Unavailable => "out of stock",
            Availability::Indeterminate => "unknown",
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Availability::Available => "available",
            Availability::Unavailable => "unavailable",
            Availability::Indeterminate => "indeterminate",
        };
        f.write_str(s)
    }
}

/// Strategy used to interpret fetched content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    #[default]
    Text,
    Selector,
    ApiPath,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckKind::Text => "text",
            CheckKind::Selector => "selector",
            CheckKind::ApiPath => "api-path",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Judgement {
    pub availability: Availability,
    pub message: String,
}

impl Judgement {
    fn new(availability: Availability, message: impl Into<String>) -> Self {
        Self {
            availability,
            message: message.into(),
        }
    }
}

/// Classifies `content` according to the check definition.
///
/// Evaluation order: interstitial marker, the kind-specific check, then the
/// out-of-stock keyword fallback.
pub fn judge(
    content: &str,
    kind: CheckKind,
    pattern: &str,
    expected: Option<&str>,
) -> Judgement {
    if blocked_marker(content).is_some() {
        return Judgement::new(
            Availability::Indeterminate,
            "blocked by protective firewall, cannot classify",
        );
    }

    let primary = match kind {
        CheckKind::Text => judge_text(content, pattern),
        CheckKind::Selector => judge_selector(content, pattern, expected),
        CheckKind::ApiPath => judge_api_path(content, pattern, expected),
    };

    apply_keyword_fallback(content, primary)
}

fn judge_text(content: &str, pattern: &str) -> Judgement {
    if content.contains(pattern) {
        Judgement::new(
            Availability::Available,
            format!("matched text \"{pattern}\""),
        )
    } else {
        Judgement::new(
            Availability::Unavailable,
            format!("text \"{pattern}\" not found"),
        )
    }
}

fn judge_selector(content: &str, pattern: &str, expected: Option<&str>) -> Judgement {
    let document = scraper::Html::parse_document(content);
    let selector = match scraper::Selector::parse(pattern) {
        Ok(s) => s,
        Err(e) => {
            // Operator error, not a stock signal.
            return Judgement::new(
                Availability::Indeterminate,
                format!("invalid selector \"{pattern}\": {e}"),
            );
        }
    };

    let matched: Vec<String> = document
        .select(&selector)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .collect();

    if matched.is_empty() {
        // An absent element reads as a depleted or removed listing.
        return Judgement::new(
            Availability::Unavailable,
            format!("selector not found: {pattern}"),
        );
    }

    match expected {
        Some(exp) => {
            let joined = matched.join(" ");
            if joined.contains(exp) {
                Judgement::new(
                    Availability::Available,
                    format!("selector text contains expected \"{exp}\""),
                )
            } else {
                Judgement::new(
                    Availability::Unavailable,
                    format!("selector text does not contain expected \"{exp}\""),
                )
            }
        }
        None => Judgement::new(
            Availability::Available,
            format!("selector matched: {pattern}"),
        ),
    }
}

fn judge_api_path(content: &str, pattern: &str, expected: Option<&str>) -> Judgement {
    let root: serde_json::Value = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(e) => {
            return Judgement::new(
                Availability::Indeterminate,
                format!("response is not valid JSON: {e}"),
            );
        }
    };

    if pattern.trim().is_empty() {
        // No path configured: a parseable response means reachable.
        return Judgement::new(
            Availability::Available,
            "endpoint returned a parseable response",
        );
    }

    let resolved = match walk_path(&root, pattern) {
        Some(v) => v,
        None => {
            return Judgement::new(
                Availability::Unavailable,
                format!("path absent: {pattern}"),
            );
        }
    };

    match expected {
        Some(exp) => {
            let value = stringify(resolved);
            if value == exp {
                Judgement::new(
                    Availability::Available,
                    format!("value at {pattern} equals expected \"{exp}\""),
                )
            } else {
                Judgement::new(
                    Availability::Unavailable,
                    format!("value at {pattern} is \"{value}\", expected \"{exp}\""),
                )
            }
        }
        None => Judgement::new(
            Availability::Available,
            format!("path resolved: {pattern}"),
        ),
    }
}

/// Walks a dotted path over JSON objects. Array indexing is deliberately not
/// supported; paths address object members only.
fn walk_path<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = root;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn apply_keyword_fallback(content: &str, primary: Judgement) -> Judgement {
    let lowered = content.to_lowercase();
    for keyword in OUT_OF_STOCK_KEYWORDS {
        if lowered.contains(keyword) {
            return Judgement::new(
                Availability::Unavailable,
                format!("out-of-stock keyword matched: \"{keyword}\""),
            );
        }
    }
    primary
}
