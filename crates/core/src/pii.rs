//! Regex-based PII redaction applied before conversation text leaves the tenant boundary.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::trace::{Message, MessageRole, ToolCall, ToolPayload};

pub const DEFAULT_PREVIEW_LENGTH: usize = 500;
const MAX_REDACTION_DEPTH: usize = 32;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid email regex")
});
static CARD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d[ -]?){12,18}\d\b").expect("valid card regex"));
static SSN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("valid ssn regex"));
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+\d{1,3}[\s.-]?)?(?:\(\d{3}\)\s?|\b\d{3}[\s.-]?)\d{3}[\s.-]?\d{4}\b")
        .expect("valid phone regex")
});
static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b\d{1,6}\s+(?:[A-Z][A-Za-z0-9.'-]*\s+){1,4}(?i:street|st|avenue|ave|road|rd|boulevard|blvd|lane|ln|drive|dr|court|ct|way|place|pl|terrace|parkway|pkwy)\b",
    )
    .expect("valid address regex")
});
static NAME_INTRO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b((?i:my\s+name\s+is|my\s+name's|call\s+me|i\s+am|i'm))\s+[A-Z][a-z'-]+(?:\s+[A-Z][a-z'-]+)?")
        .expect("valid name intro regex")
});

/// Ordered substitutions. Specific shapes run before the generic digit patterns.
pub fn redact_pii(text: &str) -> String {
    let text = EMAIL_RE.replace_all(text, "[EMAIL]");
    let text = CARD_RE.replace_all(&text, "[CARD]");
    let text = SSN_RE.replace_all(&text, "[SSN]");
    let text = PHONE_RE.replace_all(&text, "[PHONE]");
    let text = ADDRESS_RE.replace_all(&text, "[ADDRESS]");
    let text = NAME_INTRO_RE.replace_all(&text, |caps: &Captures<'_>| format!("{} [NAME]", &caps[1]));
    text.into_owned()
}

fn sensitive_key(key: &str) -> Option<&'static str> {
    let compact: String = key
        .chars()
        .filter(|ch| !matches!(ch, '_' | '-' | ' ' | '.'))
        .flat_map(char::to_lowercase)
        .collect();

    match compact.as_str() {
        "email" | "emailaddress" | "mail" | "useremail" | "customeremail" => Some("EMAIL"),
        "phone" | "phonenumber" | "mobile" | "mobilenumber" | "tel" | "telephone" | "cell"
        | "customerphone" => Some("PHONE"),
        "address" | "streetaddress" | "homeaddress" | "addr" | "billingaddress"
        | "shippingaddress" => Some("ADDRESS"),
        "ssn" | "socialsecurity" | "socialsecuritynumber" => Some("SSN"),
        "card" | "cardnumber" | "creditcard" | "creditcardnumber" | "ccnumber" | "pan" => {
            Some("CARD")
        }
        "password" | "passwd" | "pwd" | "passcode" => Some("PASSWORD"),
        _ => None,
    }
}

/// Recursively redacts string leaves. Values under a sensitive key are replaced wholesale,
/// whatever their shape.
pub fn redact_object_pii(value: &Value) -> Value {
    redact_value(value, 0)
}

fn redact_value(value: &Value, depth: usize) -> Value {
    if depth >= MAX_REDACTION_DEPTH {
        return Value::String("[REDACTED_NESTED]".to_string());
    }

    match value {
        Value::String(text) => Value::String(redact_pii(text)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| redact_value(item, depth + 1)).collect())
        }
        Value::Object(fields) => {
            let mut redacted = Map::with_capacity(fields.len());
            for (key, field) in fields {
                let replacement = match sensitive_key(key) {
                    Some(label) => Value::String(format!("[REDACTED_{label}]")),
                    None => redact_value(field, depth + 1),
                };
                redacted.insert(key.clone(), replacement);
            }
            Value::Object(redacted)
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
    }
}

pub fn redact_messages(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .map(|message| Message { content: redact_pii(&message.content), ..message.clone() })
        .collect()
}

pub fn redact_tool_calls(tool_calls: &[ToolCall]) -> Vec<ToolCall> {
    tool_calls
        .iter()
        .map(|call| ToolCall {
            input: ToolPayload(redact_object_pii(&call.input.0)),
            output: ToolPayload(redact_object_pii(&call.output.0)),
            error: call.error.as_deref().map(redact_pii),
            ..call.clone()
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Minimal projection for reviewer listings: redacted, then cut to `max_len` chars.
pub fn redact_messages_for_preview(messages: &[Message], max_len: usize) -> Vec<PreviewMessage> {
    messages
        .iter()
        .map(|message| PreviewMessage {
            role: message.role,
            content: redact_pii(&message.content).chars().take(max_len).collect(),
        })
        .collect()
}
