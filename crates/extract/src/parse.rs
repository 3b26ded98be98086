//! Recovery of structured content from free-form model replies.
//!
//! Replies are classified before validation: a sentinel sentence, a JSON
//! object with the fields the template asked for, a refusal, or malformed
//! text. Recoverable noise (code fences, commentary around the object,
//! template-escaped `{{ }}` braces) is stripped locally.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::normalizer::key;
use crate::prompt::ReplyShape;
use crate::schema::{NOT_DISCUSSED, Sentinel};

/// A reply that has the expected shape but has not been validated yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParsedReply {
    Sentinel(Sentinel),
    Object(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyFailure {
    Refused,
    Malformed(String),
}

const REFUSAL_MARKERS: &[&str] = &[
    "i cannot",
    "i can't",
    "i can not",
    "i am unable",
    "i'm unable",
    "i won't",
    "i will not",
    "as an ai",
    "i'm sorry",
    "i am sorry",
    "i apologize",
    "cannot assist",
    "cannot help with",
];

pub fn parse_reply(raw: &str, shape: ReplyShape) -> Result<ParsedReply, ReplyFailure> {
    let text = strip_fences(raw.trim());
    if text.is_empty() {
        return Err(ReplyFailure::Malformed("empty reply".to_string()));
    }

    if let Some(sentinel) = detect_sentinel(text) {
        return Ok(ParsedReply::Sentinel(sentinel));
    }

    // A bare JSON string literal holding a sentinel.
    if let Ok(Value::String(inner)) = serde_json::from_str::<Value>(text) {
        if let Some(sentinel) = detect_sentinel(&inner) {
            return Ok(ParsedReply::Sentinel(sentinel));
        }
    }

    match extract_object(text) {
        Some(object) => {
            let missing: Vec<&str> = shape
                .required_fields()
                .iter()
                .copied()
                .filter(|field| !object.contains_key(*field))
                .collect();
            if missing.is_empty() {
                Ok(ParsedReply::Object(object))
            } else {
                Err(ReplyFailure::Malformed(format!(
                    "reply object is missing {}",
                    missing.join(", ")
                )))
            }
        }
        None if looks_like_refusal(text) => Err(ReplyFailure::Refused),
        None => Err(ReplyFailure::Malformed("no JSON object in reply".to_string())),
    }
}

/// Remove a surrounding Markdown code fence, keeping whatever it wraps.
fn strip_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after_open = &text[open + 3..];
    // skip the info string ("json") up to the end of the line
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

fn detect_sentinel(text: &str) -> Option<Sentinel> {
    let normalized = key(text.trim().trim_matches(|c: char| c == '"' || c == '\''));
    if normalized.is_empty() {
        return None;
    }

    // The full sentence may be followed by commentary.
    if normalized.starts_with(&key(NOT_DISCUSSED)) {
        return Some(Sentinel::NotDiscussed);
    }
    match normalized.as_str() {
        "not discussed" | "the target country is not discussed" | "target not discussed" => {
            Some(Sentinel::NotDiscussed)
        }
        "insufficient data" | "insufficient_data" => Some(Sentinel::InsufficientData),
        "mentioned without characterization" | "mentioned without characterisation" => {
            Some(Sentinel::MentionedWithoutCharacterization)
        }
        _ => None,
    }
}

/// Outermost `{ ... }` span, parsed leniently.
fn extract_object(text: &str) -> Option<Map<String, Value>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let candidate = &text[start..=end];

    let parsed = serde_json::from_str::<Value>(candidate)
        .ok()
        .or_else(|| serde_json::from_str::<Value>(&collapse_doubled_braces(candidate)).ok())?;

    match parsed {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn collapse_doubled_braces(text: &str) -> String {
    text.replace("{{", "{").replace("}}", "}")
}

fn looks_like_refusal(text: &str) -> bool {
    let head: String = text.chars().take(200).collect::<String>().to_lowercase();
    REFUSAL_MARKERS.iter().any(|marker| head.contains(marker))
}
