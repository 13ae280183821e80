//! Completion detection for model action segments.
//!
//! The model signals completion with a structured marker
//! (`{"_metadata": "finish", "content": "..."}`), with the legacy plain call
//! `finish(message="...")`, or by naming `finish` inside the regular call shape
//! `do(action="finish", message="...")`. This module is the only place that
//! turns model output into a completion; disagreement between the structured
//! and legacy criteria is logged rather than silently OR-ed away.
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::action::grammar;

const SUMMARY_CHARS: usize = 50;

/// Which criterion recognised the finish marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishEvidence {
    Structured,
    Legacy,
    Both,
    /// `do(action="finish", ...)`.
    DoCall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishSignal {
    Continue,
    Finish { message: String, evidence: FinishEvidence },
}

fn structured_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""_metadata"\s*:\s*"finish""#).expect("static regex"))
}

fn legacy_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)finish\(").expect("static regex"))
}

fn do_call_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bdo\(\s*action\s*=\s*["']?\s*finish\s*["']?\s*[,)]"#).expect("static regex")
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FinishDetector;

impl FinishDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, action_text: &str) -> FinishSignal {
        let structured = structured_marker().is_match(action_text);
        let legacy = legacy_marker().is_match(action_text);
        let do_call = do_call_marker().is_match(action_text);

        let evidence = match (structured, legacy, do_call) {
            (false, false, false) => return FinishSignal::Continue,
            (true, true, _) => FinishEvidence::Both,
            (true, false, _) => FinishEvidence::Structured,
            (false, true, _) => FinishEvidence::Legacy,
            (false, false, true) => FinishEvidence::DoCall,
        };
        match evidence {
            FinishEvidence::Both => {}
            FinishEvidence::DoCall => {
                tracing::debug!(?evidence, "finish requested through do(action=\"finish\")")
            }
            _ => tracing::debug!(?evidence, "finish criteria disagree; accepting single match"),
        }

        FinishSignal::Finish {
            message: completion_message(action_text),
            evidence,
        }
    }
}

/// Extraction order: JSON `content`, textual `"message"` scan, the `message`
/// argument of `finish(...)` or `do(action="finish", ...)`, then a truncated
/// copy of the raw action.
pub fn completion_message(action_text: &str) -> String {
    json_content(action_text)
        .or_else(|| scanned_message(action_text))
        .or_else(|| call_message(action_text))
        .unwrap_or_else(|| truncate_summary(action_text))
}

fn json_content(action_text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(action_text.trim()).ok()?;
    value.get("content")?.as_str().map(str::to_string)
}

fn scanned_message(action_text: &str) -> Option<String> {
    let key = action_text.find("\"message\"")?;
    let colon = key + action_text[key..].find(':')? + 1;
    let close = colon + action_text[colon..].find('}')?;
    let raw = action_text[colon..close].trim();
    let unquoted = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw);
    Some(unquoted.to_string())
}

fn call_message(action_text: &str) -> Option<String> {
    let call_text = match legacy_marker().find(action_text) {
        Some(m) => &action_text[m.start()..],
        None => &action_text[grammar::find_do_call(action_text)?],
    };
    grammar::parse_call(call_text)
        .ok()?
        .text("message")
        .filter(|m| !m.is_empty())
}

fn truncate_summary(action_text: &str) -> String {
    if action_text.chars().count() > SUMMARY_CHARS {
        let head: String = action_text.chars().take(SUMMARY_CHARS).collect();
        format!("{head}...")
    } else {
        action_text.to_string()
    }
}
