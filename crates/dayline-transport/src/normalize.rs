//! Payload normalization: any service reply → one canonical value.
//!
//! Priority, first match wins:
//! 1. the reply's `structuredContent`, as-is;
//! 2. the first content item of kind `json`, its value;
//! 3. the first content item of kind `text`, as `{"text": ...}`;
//! 4. `{"raw": <the whole reply rendered as JSON>}`.
//!
//! Branch 2 scans every item before branch 3 looks at any, so a `json` item
//! wins over an earlier `text` item.

use serde_json::{json, Value};
use tracing::debug;

use crate::protocol::RawReply;

pub fn normalize(reply: &RawReply) -> Value {
    if let Some(structured) = &reply.structured_content {
        return structured.clone();
    }

    if let Some(value) = reply
        .content
        .iter()
        .filter(|item| item.kind == "json")
        .find_map(|item| item.json.clone())
    {
        return value;
    }

    if let Some(text) = reply
        .content
        .iter()
        .filter(|item| item.kind == "text")
        .find_map(|item| item.text.clone())
    {
        return json!({ "text": text });
    }

    debug!(
        "No structured or text content in reply ({} items), keeping raw rendering",
        reply.content.len()
    );
    json!({ "raw": reply.render() })
}
