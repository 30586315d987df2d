//! Salvage parsing of generated decision text.
//!
//! Local models asked for JSON still wrap it in prose, stop mid-object when
//! they hit the token limit, or mangle the structure. [`salvage`] recovers a
//! decision from such text in increasingly lenient steps:
//!
//! 1. strict parse of the whole text;
//! 2. each balanced `{...}` fragment, found with a string- and escape-aware
//!    scan, parsed strictly in order;
//! 3. a truncated fragment cut back to its last complete value and closed;
//! 4. a key scan for a quoted `disposition` value, which only trusts the
//!    disposition and a numeric confidence.
//!
//! A disposition outside keep/archive/delete is a [`ParseFailure`], never a
//! default. The function is pure: the same text always gives the same result.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::Disposition;

const MAX_REASON_CHARS: usize = 300;
const MAX_SUMMARY_CHARS: usize = 1000;

static DISPOSITION_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"(?:disposition|decision)"\s*:\s*"([^"]*)""#).expect("valid disposition pattern")
});

static CONFIDENCE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"confidence"\s*:\s*"?([0-9]*\.?[0-9]+)"#).expect("valid confidence pattern")
});

/// Which recovery step produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SalvageMethod {
    Strict,
    Fragment,
    Repaired,
    KeyScan,
}

/// A decision recovered from generated text.
///
/// Labels are returned as the model wrote them; normalization happens later.
#[derive(Debug, Clone, PartialEq)]
pub struct Salvaged {
    pub disposition: Disposition,
    pub labels: Vec<String>,
    pub confidence: Option<f32>,
    pub reason: Option<String>,
    pub summary: Option<String>,
    pub method: SalvageMethod,
}

/// Why no decision could be recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseFailureKind {
    /// Nothing but whitespace.
    Empty,
    /// No JSON object and no disposition key anywhere.
    NoObject,
    /// Objects were found, none carrying a disposition.
    MissingDisposition,
    /// A disposition was found with a value outside keep/archive/delete.
    UnknownDisposition,
}

impl ParseFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseFailureKind::Empty => "empty",
            ParseFailureKind::NoObject => "no_object",
            ParseFailureKind::MissingDisposition => "missing_disposition",
            ParseFailureKind::UnknownDisposition => "unknown_disposition",
        }
    }
}

impl fmt::Display for ParseFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generated text from which no decision could be recovered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct ParseFailure {
    pub kind: ParseFailureKind,
    pub detail: String,
    /// The generated text, unchanged.
    pub raw: String,
}

impl ParseFailure {
    fn new(kind: ParseFailureKind, detail: impl Into<String>, raw: &str) -> Self {
        Self {
            kind,
            detail: detail.into(),
            raw: raw.to_string(),
        }
    }
}

/// Why one candidate object was not accepted.
#[derive(Debug, Clone)]
enum Rejection {
    Missing,
    Unknown(String),
}

/// Recovers a decision from raw generated text.
pub fn salvage(raw: &str) -> Result<Salvaged, ParseFailure> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ParseFailure::new(ParseFailureKind::Empty, "no generated text", raw));
    }

    let mut rejection: Option<Rejection> = None;

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        match interpret(&map, SalvageMethod::Strict) {
            Ok(decision) => return Ok(decision),
            Err(r) => {
                rejection.get_or_insert(r);
            }
        }
    }

    let mut start = 0;
    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        let (candidates, method, end) = match scan_object(text, open) {
            Scan::Balanced(end) => (vec![text[open..end].to_string()], SalvageMethod::Fragment, Some(end)),
            Scan::Truncated(repairs) => (repairs, SalvageMethod::Repaired, None),
        };

        let mut parsed = false;
        for candidate in candidates {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&candidate) {
                match interpret(&map, method) {
                    Ok(decision) => return Ok(decision),
                    Err(r) => {
                        rejection.get_or_insert(r);
                    }
                }
                parsed = true;
                break;
            }
        }

        // Objects nested in a parsed object are its fields, not answers.
        start = match (parsed, end) {
            (false, _) => open + 1,
            (true, Some(end)) => end,
            (true, None) => break,
        };
    }

    // The key scan is for mangled text only; it would otherwise pick up a
    // disposition nested in an object that was already rejected.
    if rejection.is_some() {
        return Err(failure_from(rejection, raw));
    }

    if let Some(caps) = DISPOSITION_KEY.captures(text) {
        let value = caps[1].trim();
        match value.parse::<Disposition>() {
            Ok(disposition) => {
                let confidence = CONFIDENCE_KEY
                    .captures(text)
                    .and_then(|c| c[1].parse::<f64>().ok())
                    .and_then(clamp_confidence);
                return Ok(Salvaged {
                    disposition,
                    labels: Vec::new(),
                    confidence,
                    reason: None,
                    summary: None,
                    method: SalvageMethod::KeyScan,
                });
            }
            Err(_) => {
                rejection = Some(Rejection::Unknown(value.to_string()));
            }
        }
    }

    Err(failure_from(rejection, raw))
}

fn failure_from(rejection: Option<Rejection>, raw: &str) -> ParseFailure {
    match rejection {
        Some(Rejection::Unknown(value)) => ParseFailure::new(
            ParseFailureKind::UnknownDisposition,
            format!("unrecognized disposition {:?}", value),
            raw,
        ),
        Some(Rejection::Missing) => ParseFailure::new(
            ParseFailureKind::MissingDisposition,
            "object has no disposition",
            raw,
        ),
        None => ParseFailure::new(ParseFailureKind::NoObject, "no JSON object found", raw),
    }
}

fn interpret(map: &Map<String, Value>, method: SalvageMethod) -> Result<Salvaged, Rejection> {
    let value = match field(map, &["disposition", "decision"]) {
        None | Some(Value::Null) => return Err(Rejection::Missing),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    let disposition = value
        .parse::<Disposition>()
        .map_err(|_| Rejection::Unknown(value.trim().to_string()))?;

    Ok(Salvaged {
        disposition,
        labels: field(map, &["labels", "category", "categories"])
            .map(labels_from)
            .unwrap_or_default(),
        confidence: field(map, &["confidence"]).and_then(confidence_from),
        reason: field(map, &["reason"]).and_then(|v| text_from(v, MAX_REASON_CHARS)),
        summary: field(map, &["summary"]).and_then(|v| text_from(v, MAX_SUMMARY_CHARS)),
        method,
    })
}

/// First present key among `names`, compared case-insensitively.
fn field<'a>(map: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| {
        map.iter()
            .find(|(key, _)| key.trim().eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

fn labels_from(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

fn confidence_from(value: &Value) -> Option<f32> {
    let number = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    clamp_confidence(number)
}

fn clamp_confidence(value: f64) -> Option<f32> {
    value.is_finite().then(|| value.clamp(0.0, 1.0) as f32)
}

fn text_from(value: &Value, max_chars: usize) -> Option<String> {
    let text = value.as_str()?.trim();
    (!text.is_empty()).then(|| text.chars().take(max_chars).collect())
}

enum Scan {
    /// The object closes at this byte offset (exclusive).
    Balanced(usize),
    /// The text ends inside the object; repair attempts, most complete first.
    Truncated(Vec<String>),
}

struct Frame {
    closer: char,
    /// Inside an object, the next string is a key.
    expecting_key: bool,
}

fn closers(stack: &[Frame]) -> String {
    stack.iter().rev().map(|f| f.closer).collect()
}

fn ends_token(b: u8) -> bool {
    b.is_ascii_whitespace() || matches!(b, b',' | b':' | b'"' | b'{' | b'}' | b'[' | b']')
}

/// Scans the object opening at `open`, tracking strings and nesting.
///
/// Every point after a complete value (or an opening bracket) is a point at
/// which the prefix plus the pending closers is valid JSON.
fn scan_object(text: &str, open: usize) -> Scan {
    let bytes = text.as_bytes();
    let mut stack: Vec<Frame> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut in_token = false;
    let mut safe: Option<(usize, String)> = None;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
                let was_key = stack.last().is_some_and(|f| f.expecting_key);
                if !was_key {
                    safe = Some((i + 1, closers(&stack)));
                }
            }
            continue;
        }

        if in_token && ends_token(b) {
            in_token = false;
            safe = Some((i, closers(&stack)));
        }

        match b {
            b'"' => in_string = true,
            b'{' | b'[' => {
                stack.push(Frame {
                    closer: if b == b'{' { '}' } else { ']' },
                    expecting_key: b == b'{',
                });
                safe = Some((i + 1, closers(&stack)));
            }
            b'}' | b']' => {
                stack.pop();
                if stack.is_empty() {
                    return Scan::Balanced(i + 1);
                }
                safe = Some((i + 1, closers(&stack)));
            }
            b':' => {
                if let Some(frame) = stack.last_mut() {
                    frame.expecting_key = false;
                }
            }
            b',' => {
                if let Some(frame) = stack.last_mut() {
                    frame.expecting_key = frame.closer == '}';
                }
            }
            b if b.is_ascii_whitespace() => {}
            _ => in_token = true,
        }
    }

    let mut repairs = Vec::with_capacity(2);
    if !in_string {
        let head = text[open..].trim_end().trim_end_matches(',');
        repairs.push(format!("{}{}", head, closers(&stack)));
    }
    if let Some((end, closing)) = safe {
        repairs.push(format!("{}{}", &text[open..end], closing));
    }
    Scan::Truncated(repairs)
}
