//! Splitting unit bytes into JSON documents.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a unit's bytes are laid out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// The whole file is one document, or an array of documents.
    #[default]
    WholeFile,
    /// One document per non-empty line.
    JsonLines,
}

/// One document parsed from a unit, or the raw text that failed to parse.
#[derive(Debug, Clone, PartialEq)]
pub enum RawDocument {
    /// A JSON object.
    Parsed(Value),
    /// Text that is not a JSON object; base64 when the bytes are not UTF-8.
    Corrupt(String),
}

/// Splits a unit into documents. Never fails: bad input becomes `Corrupt`.
#[must_use]
pub fn split_documents(bytes: &[u8], format: SourceFormat) -> Vec<RawDocument> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(_) => {
            return vec![RawDocument::Corrupt(
                base64::engine::general_purpose::STANDARD.encode(bytes),
            )]
        }
    };

    match format {
        SourceFormat::WholeFile => split_whole_file(text),
        SourceFormat::JsonLines => text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| match serde_json::from_str::<Value>(line) {
                Ok(value) => classify(value, line),
                Err(_) => RawDocument::Corrupt(line.to_string()),
            })
            .collect(),
    }
}

fn split_whole_file(text: &str) -> Vec<RawDocument> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .map(|item| {
                let raw = item.to_string();
                classify(item, &raw)
            })
            .collect(),
        Ok(value) => vec![classify(value, text.trim())],
        Err(_) => vec![RawDocument::Corrupt(text.to_string())],
    }
}

fn classify(value: Value, raw: &str) -> RawDocument {
    if value.is_object() {
        RawDocument::Parsed(value)
    } else {
        RawDocument::Corrupt(raw.to_string())
    }
}
