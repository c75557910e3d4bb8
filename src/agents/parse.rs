//! Collaborator response parsing.
//!
//! Collaborators are asked for bare JSON but routinely wrap it in prose or
//! markdown fences. Parsing follows an ordered fallback chain: strict parse
//! of the whole payload, then best-effort extraction of the embedded JSON
//! object, then a hard failure that carries the strict parse error.

use anyhow::Result;
use serde::de::DeserializeOwned;

/// Parse a collaborator response into `T` via the fallback chain.
pub fn parse_response<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let trimmed = raw.trim();
    let strict_err = match serde_json::from_str(trimmed) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    if let Some(extracted) = extract_json_object(trimmed)
        && let Ok(value) = serde_json::from_str(extracted)
    {
        return Ok(value);
    }

    Err(anyhow::anyhow!(
        "Response is not valid JSON for the expected schema: {}",
        strict_err
    ))
}

/// Best-effort slice of the JSON object inside a blob of text: the inside
/// of the first fenced code block when one exists, otherwise the span from
/// the first `{` to the last `}`.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let body = fenced_block(raw).unwrap_or(raw);
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&body[start..=end])
}

fn fenced_block(raw: &str) -> Option<&str> {
    let open = raw.find("```")?;
    let after = &raw[open + 3..];
    // Skip the info string ("json", "JSON", or nothing).
    let newline = after.find('\n')?;
    let body = &after[newline + 1..];
    let close = body.find("```")?;
    Some(&body[..close])
}
