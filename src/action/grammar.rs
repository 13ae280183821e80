//! Call grammar for model actions: `do(action="Tap", element=[500, 300])`.
//! Completion calls (`finish(...)`, `do(action="finish")`) parse here but only
//! `FinishDetector` turns them into a terminal action.
//!
//! Values are quoted strings (`"` or `'`, backslash escapes), numbers, lists
//! `[v, ...]`, or bare words. Action names match case-insensitively with spaces,
//! underscores and dashes ignored, so `"Long Press"`, `Long_Press` and
//! `longpress` are the same action.
use std::ops::Range;

use thiserror::Error;

use crate::action::types::{Action, Point};

const DO_CALL_PREFIX: &str = "do(action=";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GrammarError {
    #[error("syntax error at {pos}: {reason}")]
    Syntax { pos: usize, reason: String },

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("'{0}' ends the task and is not a device action")]
    Completion(String),

    #[error("action '{action}' is missing argument '{arg}'")]
    MissingArgument { action: String, arg: String },

    #[error("action '{action}' has an invalid '{arg}' argument")]
    InvalidArgument { action: String, arg: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Str(String),
    Num(f64),
    List(Vec<ArgValue>),
    Bare(String),
}

impl ArgValue {
    /// Textual view of scalar values; lists have none.
    fn as_text(&self) -> Option<String> {
        match self {
            ArgValue::Str(s) | ArgValue::Bare(s) => Some(s.clone()),
            ArgValue::Num(n) => Some(format_number(*n)),
            ArgValue::List(_) => None,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallExpr {
    pub name: String,
    pub args: Vec<(String, ArgValue)>,
}

impl CallExpr {
    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.args.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key).and_then(ArgValue::as_text)
    }
}

/// Byte range of the first `do(action=...)` occurrence whose parentheses balance.
///
/// Quoted strings are skipped while counting so a `)` inside `text="..."` does
/// not close the call. An occurrence that never closes is skipped.
pub fn find_do_call(text: &str) -> Option<Range<usize>> {
    for (start, _) in text.match_indices(DO_CALL_PREFIX) {
        let preceded_by_ident = text[..start]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || c == '_');
        if preceded_by_ident {
            continue;
        }
        let open = start + "do".len();
        if let Some(end) = balanced_close(text, open) {
            return Some(start..end);
        }
    }
    None
}

/// Given the byte index of an opening `(`, returns the byte index just past the
/// matching `)`.
fn balanced_close(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (offset, c) in text[open..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open + offset + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    fn new(text: &str) -> Self {
        Self { chars: text.chars().collect(), pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> Result<(), GrammarError> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            other => Err(self.error(format!("expected '{want}', found {other:?}"))),
        }
    }

    fn error(&self, reason: String) -> GrammarError {
        GrammarError::Syntax { pos: self.pos, reason }
    }

    fn ident(&mut self) -> Result<String, GrammarError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected identifier".into()));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn value(&mut self) -> Result<ArgValue, GrammarError> {
        self.skip_ws();
        match self.peek() {
            Some(q @ ('"' | '\'')) => {
                self.pos += 1;
                self.quoted(q).map(ArgValue::Str)
            }
            Some('[') => {
                self.pos += 1;
                self.list()
            }
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                let start = self.pos;
                while self
                    .peek()
                    .is_some_and(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
                {
                    self.pos += 1;
                }
                let raw: String = self.chars[start..self.pos].iter().collect();
                match raw.parse::<f64>() {
                    Ok(n) => Ok(ArgValue::Num(n)),
                    Err(_) => {
                        self.pos = start;
                        self.bare()
                    }
                }
            }
            Some(_) => self.bare(),
            None => Err(self.error("unexpected end of input".into())),
        }
    }

    fn quoted(&mut self, quote: char) -> Result<String, GrammarError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string".into())),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated escape".into())),
                },
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
            }
        }
    }

    fn list(&mut self) -> Result<ArgValue, GrammarError> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(']') {
                self.pos += 1;
                return Ok(ArgValue::List(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => {}
                Some(']') => return Ok(ArgValue::List(items)),
                other => return Err(self.error(format!("expected ',' or ']' in list, found {other:?}"))),
            }
        }
    }

    fn bare(&mut self) -> Result<ArgValue, GrammarError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| !matches!(c, ',' | ')' | ']')) {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        let word = word.trim();
        if word.is_empty() {
            return Err(self.error("expected value".into()));
        }
        Ok(ArgValue::Bare(word.to_string()))
    }
}

/// Parses one call expression. Text after the closing parenthesis is ignored.
pub fn parse_call(text: &str) -> Result<CallExpr, GrammarError> {
    let mut cur = Cursor::new(text.trim());
    let name = cur.ident()?;
    cur.skip_ws();
    cur.expect('(')?;

    let mut args = Vec::new();
    loop {
        cur.skip_ws();
        if cur.peek() == Some(')') {
            cur.pos += 1;
            break;
        }
        let key = cur.ident()?;
        cur.skip_ws();
        cur.expect('=')?;
        let value = cur.value()?;
        args.push((key, value));
        cur.skip_ws();
        match cur.bump() {
            Some(',') => {}
            Some(')') => break,
            other => return Err(cur.error(format!("expected ',' or ')', found {other:?}"))),
        }
    }

    if cur.pos < cur.chars.len() {
        tracing::debug!(trailing = cur.chars.len() - cur.pos, "ignoring text after action call");
    }
    Ok(CallExpr { name, args })
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Parses and decodes `text` into a typed action.
pub fn decode_action_text(text: &str) -> Result<Action, GrammarError> {
    decode_action(&parse_call(text)?)
}

pub fn decode_action(call: &CallExpr) -> Result<Action, GrammarError> {
    let callee = normalize_name(&call.name);
    if callee == "finish" {
        return Err(GrammarError::Completion(call.name.clone()));
    }
    if callee != "do" {
        return Err(GrammarError::UnknownAction(call.name.clone()));
    }

    let action_name = call.text("action").ok_or_else(|| GrammarError::MissingArgument {
        action: "do".into(),
        arg: "action".into(),
    })?;

    let required_text = |arg: &str| -> Result<String, GrammarError> {
        call.text(arg).ok_or_else(|| GrammarError::MissingArgument {
            action: action_name.clone(),
            arg: arg.into(),
        })
    };
    let required_point = |arg: &str| -> Result<Point, GrammarError> {
        let value = call.get(arg).ok_or_else(|| GrammarError::MissingArgument {
            action: action_name.clone(),
            arg: arg.into(),
        })?;
        point_from(value).ok_or_else(|| GrammarError::InvalidArgument {
            action: action_name.clone(),
            arg: arg.into(),
        })
    };

    let action = match normalize_name(&action_name).as_str() {
        "launch" => Action::Launch {
            app: call
                .text("app")
                .or_else(|| call.text("package_name"))
                .ok_or_else(|| GrammarError::MissingArgument {
                    action: action_name.clone(),
                    arg: "app".into(),
                })?,
        },
        "tap" => Action::Tap {
            point: required_point("element")?,
            confirm: call.text("message"),
        },
        "type" => Action::Type { text: required_text("text")? },
        "typename" => Action::TypeName { text: required_text("text")? },
        "swipe" => Action::Swipe {
            start: required_point("start")?,
            end: required_point("end")?,
        },
        "longpress" => Action::LongPress { point: required_point("element")? },
        "doubletap" => Action::DoubleTap { point: required_point("element")? },
        "back" => Action::Back,
        "home" => Action::Home,
        "wait" => Action::Wait {
            seconds: match call.get("duration") {
                None => 1.0,
                Some(v) => seconds_from(v).ok_or_else(|| GrammarError::InvalidArgument {
                    action: action_name.clone(),
                    arg: "duration".into(),
                })?,
            },
        },
        "note" => Action::Note { message: call.text("message").unwrap_or_default() },
        "callapi" => Action::CallApi { instruction: required_text("instruction")? },
        "interact" => Action::Interact,
        "takeover" => Action::TakeOver { message: call.text("message").unwrap_or_default() },
        "finish" => return Err(GrammarError::Completion(action_name.clone())),
        _ => return Err(GrammarError::UnknownAction(action_name.clone())),
    };
    Ok(action)
}

fn point_from(value: &ArgValue) -> Option<Point> {
    match value {
        ArgValue::List(items) if items.len() == 2 => match (&items[0], &items[1]) {
            (ArgValue::Num(x), ArgValue::Num(y)) => Some(Point::clamped(*x, *y)),
            _ => None,
        },
        // Some models quote the coordinate list: element="[500, 300]"
        ArgValue::Str(s) => {
            let mut cur = Cursor::new(s.trim());
            cur.value().ok().as_ref().and_then(|v| match v {
                ArgValue::List(_) => point_from(v),
                _ => None,
            })
        }
        _ => None,
    }
}

/// Accepts `2`, `"2"`, `"2 seconds"`, `"1.5s"`.
fn seconds_from(value: &ArgValue) -> Option<f64> {
    match value {
        ArgValue::Num(n) if *n >= 0.0 => Some(*n),
        ArgValue::Str(s) | ArgValue::Bare(s) => {
            let digits: String = s
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            digits.parse::<f64>().ok()
        }
        _ => None,
    }
}
