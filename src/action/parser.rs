use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::action::finish::{FinishDetector, FinishSignal};
use crate::action::grammar;
use crate::action::types::{Action, ParsedAction};

/// Which input convention the response followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseForm {
    /// `<think>…</think><answer>…</answer>`
    Tagged,
    /// Reasoning text followed by a bare `do(action=…)` call.
    BareCall,
    /// Neither; the whole input was taken as the action segment.
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub thinking: String,
    /// The action segment exactly as extracted (trimmed for the tagged form).
    pub action_text: String,
    pub form: ResponseForm,
    pub action: ParsedAction,
    /// Completion decision for the action segment. A run ends on this, never
    /// on the decoded action alone.
    pub finish: FinishSignal,
    /// Think/answer delimiters appeared without matching partners.
    pub unbalanced_tags: bool,
}

impl ParsedResponse {
    pub fn is_degraded(&self) -> bool {
        self.unbalanced_tags
            || self.form == ResponseForm::Fallback
            || matches!(self.action, ParsedAction::RawText(_))
    }
}

fn think_pair() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>(.*?)</think>").expect("static regex"))
}

fn answer_pair() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<answer>(.*?)</answer>").expect("static regex"))
}

const TAG_PAIRS: [(&str, &str); 2] = [("<think>", "</think>"), ("<answer>", "</answer>")];

/// Splits raw model output into reasoning and action. Never fails: input that
/// matches no known convention comes back as a `RawText` fallback.
pub fn parse(raw: &str) -> ParsedResponse {
    let unbalanced_tags = tags_unbalanced(raw);
    if unbalanced_tags {
        tracing::warn!(preview = %preview(raw), "response contains unpaired or mismatched think/answer tags");
    }

    let (thinking, action_text, form) = split_segments(raw);
    let finish = FinishDetector::new().detect(&action_text);
    let action = interpret(&action_text, &finish);

    if form == ResponseForm::Fallback {
        tracing::warn!(
            len = raw.len(),
            preview = %preview(raw),
            "degraded parse: no tagged or do(action=...) segment found"
        );
    }
    if let ParsedAction::RawText(_) = &action {
        tracing::warn!(?form, action = %preview(&action_text), "action segment is not a decodable action");
    }

    ParsedResponse {
        thinking,
        action_text,
        form,
        action,
        finish,
        unbalanced_tags,
    }
}

fn tags_unbalanced(raw: &str) -> bool {
    TAG_PAIRS
        .iter()
        .any(|(open, close)| raw.matches(open).count() != raw.matches(close).count())
}

fn split_segments(raw: &str) -> (String, String, ResponseForm) {
    let think = think_pair().captures(raw).and_then(|c| c.get(1));

    if let Some(answer) = answer_pair().captures(raw).and_then(|c| c.get(1)) {
        let thinking = think.map(|m| m.as_str().trim().to_string()).unwrap_or_default();
        return (thinking, answer.as_str().trim().to_string(), ResponseForm::Tagged);
    }

    // Reasoning closed properly but the action was left untagged.
    if let Some(think) = think {
        let rest_start = think.end() + "</think>".len();
        let rest = &raw[rest_start..];
        if let Some(range) = grammar::find_do_call(rest) {
            return (
                think.as_str().trim().to_string(),
                rest[range].to_string(),
                ResponseForm::BareCall,
            );
        }
    }

    if let Some(range) = grammar::find_do_call(raw) {
        let thinking = raw[..range.start].trim().to_string();
        return (thinking, raw[range].to_string(), ResponseForm::BareCall);
    }

    (String::new(), raw.to_string(), ResponseForm::Fallback)
}

fn interpret(action_text: &str, finish: &FinishSignal) -> ParsedAction {
    if let FinishSignal::Finish { message, .. } = finish {
        return ParsedAction::Action(Action::Finish { message: message.clone() });
    }
    match grammar::decode_action_text(action_text) {
        Ok(action) => ParsedAction::Action(action),
        Err(e) => {
            tracing::debug!(error = %e, "action decode failed");
            ParsedAction::RawText(action_text.to_string())
        }
    }
}

fn preview(text: &str) -> String {
    text.chars().take(80).collect()
}
